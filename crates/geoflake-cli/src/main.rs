//! geoflake command line
//!
//! Opens warehouse tables and queries as feature layers and prints what the
//! engine resolves, composes and reads.

mod config;
mod logging;
mod session;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use geoflake_engine::prelude::*;
use geoflake_engine::{collect_layers, preview};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};
use wkt::ToWkt;

#[derive(Parser)]
#[command(name = "geoflake", version, about = "Warehouse tables and queries as feature layers")]
struct Cli {
    /// Path to config.yaml
    #[arg(long, short, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every geometry column spec of a source.
    Resolve(SourceArgs),

    /// Print the statement a scan would run.
    Sql(ScanArgs),

    /// Stream features as JSON lines.
    Scan(ScanArgs),

    /// Show the first rows of a query and which columns hold cells.
    Preview(PreviewArgs),

    /// Describe a source: fields, geometry, count, extent.
    Info(SourceArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Persisted layer URI (`connection_name=... table_name=...`).
    #[arg(long, conflicts_with_all = ["table", "query"])]
    uri: Option<String>,

    /// Named connection from config.yaml.
    #[arg(long)]
    connection: Option<String>,

    #[arg(long)]
    schema: Option<String>,

    #[arg(long)]
    table: Option<String>,

    /// SQL query used as the source.
    #[arg(long)]
    query: Option<String>,

    #[arg(long)]
    geometry_column: Option<String>,

    #[arg(long)]
    primary_key: Option<String>,

    /// Subset filter kept for the lifetime of the layer.
    #[arg(long)]
    subset: Option<String>,
}

#[derive(Args)]
struct ScanArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Filter rectangle as `xmin,ymin,xmax,ymax`.
    #[arg(long)]
    bbox: Option<String>,

    /// Filter expression; dropped if the warehouse rejects it.
    #[arg(long)]
    filter: Option<String>,

    #[arg(long, value_delimiter = ',')]
    ids: Vec<i64>,

    /// Attributes to return, comma separated.
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    #[arg(long)]
    no_geometry: bool,

    /// Reproject geometries to this SRID.
    #[arg(long)]
    srid: Option<i32>,

    /// Stop after this many features.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args)]
struct PreviewArgs {
    #[arg(long)]
    connection: String,

    #[arg(long)]
    query: String,

    #[arg(long)]
    limit: Option<usize>,

    /// Group rows by geometry kind of this column instead.
    #[arg(long)]
    layers: Option<String>,
}

impl ScanArgs {
    fn request(&self) -> Result<FeatureRequest> {
        let mut request = FeatureRequest::new();
        if let Some(bbox) = &self.bbox {
            request = request.with_filter_rect(parse_bbox(bbox)?);
        }
        if let Some(filter) = &self.filter {
            request = request.with_expression(filter.clone());
        }
        if !self.ids.is_empty() {
            request = request.with_feature_ids(self.ids.clone());
        }
        if !self.fields.is_empty() {
            request = request.with_subset_of_attributes(self.fields.iter().cloned());
        }
        if self.no_geometry {
            request = request.without_geometry();
        }
        if let Some(srid) = self.srid {
            request = request.with_destination_srid(srid);
        }
        Ok(request)
    }
}

fn parse_bbox(text: &str) -> Result<BoundingBox> {
    let parts = text
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid bbox '{text}'"))?;
    match parts.as_slice() {
        [xmin, ymin, xmax, ymax] => Ok(BoundingBox::new(*xmin, *ymin, *xmax, *ymax)),
        _ => bail!("bbox needs four numbers, got '{text}'"),
    }
}

fn descriptor(args: &SourceArgs) -> Result<SourceDescriptor> {
    let mut descriptor = match &args.uri {
        Some(uri) => SourceDescriptor::parse_uri(uri)?,
        None => {
            let connection = args
                .connection
                .clone()
                .context("either --uri or --connection is required")?;
            let source = match (&args.table, &args.query) {
                (Some(table), None) => Source::table(args.schema.as_deref(), table.clone()),
                (None, Some(query)) => Source::query(query.clone()),
                _ => bail!("exactly one of --table or --query is required"),
            };
            SourceDescriptor::new(connection, source)
        }
    };
    if let Some(column) = &args.geometry_column {
        descriptor = descriptor.with_geometry_column(column.clone());
    }
    if let Some(pk) = &args.primary_key {
        descriptor = descriptor.with_primary_key(pk.clone());
    }
    Ok(descriptor)
}

fn open_source(config: &Config, args: &SourceArgs) -> Result<DataSource> {
    let descriptor = descriptor(args)?;
    let params = config.connection(&descriptor.connection)?;
    let session = session::open_session(&descriptor.connection, &params)?;
    let context = session::query_context(&params);

    let mut source = DataSource::open_in(session, descriptor, context, config.engine.clone())?;
    if let Some(subset) = &args.subset {
        if !source.set_subset_string(Some(subset))? {
            warn!(subset = %subset, "subset filter rejected, ignoring");
        }
    }
    Ok(source)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn feature_json(feature: &Feature, fields: &[String]) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .zip(&feature.attributes)
        .map(|(name, value)| (name.clone(), json!(value)))
        .collect();
    json!({
        "id": feature.id,
        "geometry": feature.geometry.as_ref().map(|g| g.wkt_string()),
        "attributes": attributes,
    })
}

fn resolve(config: &Config, args: &SourceArgs) -> Result<()> {
    let descriptor = descriptor(args)?;
    let params = config.connection(&descriptor.connection)?;
    let session = session::open_session(&descriptor.connection, &params)?;
    let context = session::query_context(&params);

    let resolver = Resolver::new(
        session.as_ref(),
        &descriptor.connection,
        &context,
        &config.engine,
    );
    let specs = resolver.resolve_all(&descriptor.source)?;
    print_json(&json!(specs))
}

fn describe(config: &Config, args: &SourceArgs) -> Result<()> {
    let source = open_source(config, args)?;
    print_json(&json!({
        "uri": source.descriptor().to_uri(),
        "fields": source.fields(),
        "primary_key": source.primary_key().map(|i| &source.fields()[i].name),
        "geometry": source.geometry_spec(),
        "feature_count": source.feature_count()?,
        "extent": source.extent()?,
        "sampled": source.is_limited(),
        "view": source.is_view()?,
    }))
}

fn explain(config: &Config, args: &ScanArgs) -> Result<()> {
    let source = open_source(config, &args.source)?;
    let query = source.explain(&args.request()?)?;
    println!("{query}");
    Ok(())
}

async fn scan(config: &Config, args: ScanArgs) -> Result<()> {
    let source = open_source(config, &args.source)?;
    let request = args.request()?;
    let names: Vec<String> = match &request.subset_of_attributes {
        Some(names) => names.clone(),
        None => source.fields().iter().map(|f| f.name.clone()).collect(),
    };
    let limit = args.limit;

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    let worker = tokio::task::spawn_blocking(move || -> Result<ScanSummary> {
        let mut iter = source.get_features(&request)?.with_cancel_flag(flag);
        let mut written = 0usize;
        while limit.map_or(true, |n| written < n) {
            let Some(feature) = iter.fetch_next()? else {
                break;
            };
            println!("{}", feature_json(&feature, &names));
            written += 1;
        }
        iter.close();
        Ok(ScanSummary {
            written,
            stats: iter.stats(),
        })
    });
    tokio::pin!(worker);

    let summary = tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling scan");
            cancel.cancel();
            worker.await??
        }
    };
    info!(
        features = summary.written,
        batches = summary.stats.batches,
        skipped = summary.stats.rows_skipped,
        "scan finished"
    );
    Ok(())
}

struct ScanSummary {
    written: usize,
    stats: geoflake_engine::ScanStats,
}

async fn run_preview(config: &Config, args: PreviewArgs) -> Result<()> {
    let params = config.connection(&args.connection)?;
    let session = session::open_session(&args.connection, &params)?;
    let context = session::query_context(&params);
    let engine = config.engine.clone();

    match args.layers {
        Some(column) => {
            let cancel = CancelFlag::new();
            let flag = cancel.clone();
            let connection = args.connection.clone();
            let query = args.query.clone();
            let worker = tokio::task::spawn_blocking(move || {
                collect_layers(
                    session.as_ref(),
                    &connection,
                    &context,
                    &query,
                    &column,
                    engine.effective_batch_size(),
                    &flag,
                )
            });
            tokio::pin!(worker);
            let groups = tokio::select! {
                result = &mut worker => result??,
                _ = tokio::signal::ctrl_c() => {
                    cancel.cancel();
                    worker.await??
                }
            };
            let summary: Vec<_> = groups
                .iter()
                .map(|g| {
                    json!({
                        "kind": g.kind,
                        "fields": g.fields,
                        "features": g.features.len(),
                    })
                })
                .collect();
            print_json(&json!(summary))
        }
        None => {
            let limit = args.limit.unwrap_or(engine.preview_limit);
            let page = preview(session.as_ref(), &args.connection, &context, &args.query, limit)?;
            print_json(&json!({
                "columns": page.columns,
                "rows": page.rows,
                "cell_flags": page.cell_flags,
                "cell_columns": page.cell_columns(),
            }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (passwords)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&config.logging);

    match cli.command {
        Command::Resolve(args) => resolve(&config, &args),
        Command::Info(args) => describe(&config, &args),
        Command::Sql(args) => explain(&config, &args),
        Command::Scan(args) => scan(&config, args).await,
        Command::Preview(args) => run_preview(&config, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bbox() {
        let bbox = parse_bbox("1, 2, 3, 4").unwrap();
        assert_eq!(bbox, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
        assert!(parse_bbox("1,2,3").is_err());
        assert!(parse_bbox("a,b,c,d").is_err());
    }

    #[test]
    fn test_descriptor_from_flags() {
        let cli = Cli::parse_from([
            "geoflake",
            "scan",
            "--connection",
            "dev",
            "--table",
            "PLACES",
            "--primary-key",
            "ID",
            "--fields",
            "NAME,POP",
            "--srid",
            "3857",
        ]);
        let Command::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        let descriptor = descriptor(&args.source).unwrap();
        assert_eq!(descriptor.connection, "dev");
        assert_eq!(descriptor.primary_key.as_deref(), Some("ID"));

        let request = args.request().unwrap();
        assert_eq!(
            request.subset_of_attributes,
            Some(vec!["NAME".to_string(), "POP".to_string()])
        );
        assert_eq!(request.destination_srid, Some(3857));
    }

    #[test]
    fn test_descriptor_requires_one_source() {
        let cli = Cli::parse_from(["geoflake", "info", "--connection", "dev"]);
        let Command::Info(args) = cli.command else {
            panic!("expected info");
        };
        assert!(descriptor(&args).is_err());
    }

    #[test]
    fn test_feature_json() {
        let mut feature = Feature::new(7);
        feature.geometry = Some(geo_types::Geometry::Point(geo_types::Point::new(1.0, 2.0)));
        feature.attributes = vec![geoflake_ir::Value::Text("x".into())];
        let value = feature_json(&feature, &["NAME".to_string()]);
        assert_eq!(value["id"], 7);
        assert_eq!(value["geometry"], "POINT(1 2)");
        assert_eq!(value["attributes"]["NAME"], "x");
    }
}
