use anyhow::{Context, Result};
use countyglm::{
    config::PipelineConfig,
    geo, ingest,
    model::effects::group_effects_table,
    output,
    pipeline::{columns, PipelineInputs},
    process::{
        keys::{CorrectionTable, StateConcordance},
        sanitize::coerce_numeric,
    },
    schema::NumericType,
    PipelineError,
};
use std::{env, fs, path::PathBuf, time::Instant};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");
    let start = Instant::now();

    // ─── 2) configuration ────────────────────────────────────────────
    let cfg = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => PipelineConfig::load(&path)?,
        None => {
            info!("no config path given; using defaults");
            PipelineConfig::default()
        }
    };
    let out_dir = cfg.output_dir.clone();
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {:?}", out_dir))?;
    fs::write(out_dir.join("config.yaml"), cfg.to_yaml()?).context("writing effective config")?;

    // ─── 3) read inputs ──────────────────────────────────────────────
    let inputs = load_inputs(&cfg)?;

    // ─── 4) build analytic table ─────────────────────────────────────
    let pipeline = cfg.pipeline();
    let table = pipeline.run(&inputs).inspect_err(log_failure)?;
    output::write_parquet(&table.data, &out_dir.join("analytic.parquet"))?;

    // ─── 5) fit models ───────────────────────────────────────────────
    let report = pipeline.fit_models(&table).inspect_err(log_failure)?;
    output::write_report(&report, &out_dir.join("models.json"))?;
    output::write_parquet(
        &group_effects_table(&report.glmm)?,
        &out_dir.join("group_effects.parquet"),
    )?;
    output::write_parquet(
        &report.group_summaries.to_dataset()?,
        &out_dir.join("group_summaries.parquet"),
    )?;

    // ─── 6) geometry records for the renderer ────────────────────────
    if let Some(path) = &cfg.inputs.geometries {
        let geoms = ingest::read_dataset(path)?;
        let geoms = ingest::to_binary(&geoms, "geometry")?;
        let geoms = coerce_numeric(&geoms, columns::FIPS, NumericType::Int64, &cfg.sentinels)?
            .select(&[columns::FIPS, "geometry"])?;
        let records = geo::join_geometries_dropping_missing(
            &geoms,
            &table.data,
            columns::FIPS,
            columns::MORTALITY,
        )
        .inspect_err(log_failure)?;
        output::write_parquet(&records, &out_dir.join("geo_records.parquet"))?;
    }

    info!(
        elapsed = ?start.elapsed(),
        rows = table.data.num_rows(),
        tau2 = report.glmm.tau2,
        "done"
    );
    Ok(())
}

fn load_inputs(cfg: &PipelineConfig) -> Result<PipelineInputs> {
    let paths = &cfg.inputs;

    let states = ingest::read_dataset(&paths.concordance)?;
    let states = coerce_numeric(
        &states,
        &paths.concordance_code_column,
        NumericType::Int64,
        &cfg.sentinels,
    )?;
    let concordance = StateConcordance::from_dataset(
        &states,
        &paths.concordance_code_column,
        &paths.concordance_abbr_column,
    )?;
    info!(states = concordance.len(), "loaded concordance");

    let corrections = match &paths.corrections {
        Some(path) => {
            let ds = ingest::read_dataset(path)?;
            let table = CorrectionTable::from_dataset(&ds, "from", "to")?;
            info!(corrections = table.len(), "loaded corrections");
            table
        }
        None => CorrectionTable::new(),
    };

    Ok(PipelineInputs {
        poverty: ingest::read_dataset(&paths.poverty)?,
        mortality: ingest::read_dataset(&paths.mortality)?,
        opioid: ingest::read_dataset(&paths.opioid)?,
        concordance,
        corrections,
    })
}

fn log_failure(err: &PipelineError) {
    error!(category = err.category(), "{}", err);
}
