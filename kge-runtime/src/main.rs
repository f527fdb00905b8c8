use anyhow::{anyhow, Result};
use clap::{arg, ArgAction, Command};
use kge_embedding::{persist, Device, EmbeddingTable, ExternalEmbedding};
use kge_structs::{config::EmbeddingConfig, core::TableStats};
use kge_utils::{jsonify, load_json_arg};
use rand::{rngs::StdRng, seq::index, SeedableRng};
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("kge-runtime")
        .about("Creates, inspects and trains sparse embedding tables")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("init")
                .about("Creates a table, initialises its rows and saves it")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(arg!(<NAME> "Table name").value_parser(clap::value_parser!(String)))
                .arg(arg!(<NUM> "Number of rows").value_parser(clap::value_parser!(usize)))
                .arg(arg!(<DIM> "Embedding dimension").value_parser(clap::value_parser!(usize)))
                .arg(
                    arg!(--path [PATH] "Directory holding the table files")
                        .default_value(".")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Prints statistics for a saved table")
                .arg(arg!(<NAME> "Table name").value_parser(clap::value_parser!(String)))
                .arg(
                    arg!(--path [PATH] "Directory holding the table files")
                        .default_value(".")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--state "Also report the saved optimizer state")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Runs synthetic minibatches against a saved table")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(arg!(<NAME> "Table name").value_parser(clap::value_parser!(String)))
                .arg(
                    arg!(--path [PATH] "Directory holding the table files")
                        .default_value(".")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--steps [STEPS] "Number of minibatches")
                        .default_value("100")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"batch-size" [BATCH_SIZE] "Rows per minibatch")
                        .default_value("32")
                        .value_parser(clap::value_parser!(usize)),
                ),
        )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let matches = cli().get_matches();

    if let Err(e) = match matches.subcommand() {
        Some(("init", sub_m)) => init_table(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<String>("NAME").unwrap().clone(),
            *sub_m.get_one::<usize>("NUM").unwrap(),
            *sub_m.get_one::<usize>("DIM").unwrap(),
            sub_m.get_one::<PathBuf>("path").unwrap().clone(),
        ),
        Some(("inspect", sub_m)) => inspect_table(
            sub_m.get_one::<String>("NAME").unwrap().clone(),
            sub_m.get_one::<PathBuf>("path").unwrap().clone(),
            *sub_m.get_one::<bool>("state").unwrap(),
        ),
        Some(("simulate", sub_m)) => simulate(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<String>("NAME").unwrap().clone(),
            sub_m.get_one::<PathBuf>("path").unwrap().clone(),
            *sub_m.get_one::<usize>("steps").unwrap(),
            *sub_m.get_one::<usize>("batch-size").unwrap(),
        ),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(config: &str) -> Result<EmbeddingConfig> {
    let config: EmbeddingConfig = load_json_arg(config)?;
    config.validate()?;
    Ok(config)
}

pub fn init_table(
    config: String,
    name: String,
    num_embeddings: usize,
    dim: usize,
    path: PathBuf,
) -> Result<()> {
    let config = load_config(&config)?;
    let emb = ExternalEmbedding::new(&config, num_embeddings, dim)?;
    emb.init(config.emb_init, config.seed_for(&name))?;
    emb.save(&path, &name)?;
    emb.table().save_state(&path, &name)?;
    println!("{}", jsonify(&table_stats(&name, emb.table(), true)?));
    Ok(())
}

pub fn inspect_table(name: String, path: PathBuf, with_state: bool) -> Result<()> {
    let table = EmbeddingTable::open(&path, &name, Device::Cpu)?;
    if with_state {
        if !persist::has_state(&path, &name) {
            return Err(anyhow!("No saved optimizer state for table '{}'", name));
        }
        table.load_state(&path, &name)?;
    }
    println!("{}", jsonify(&table_stats(&name, &table, with_state)?));
    Ok(())
}

/// Trains against `0.5 * ||e||^2`, whose gradient is the row itself, so
/// every row norm should shrink.
pub fn simulate(
    config: String,
    name: String,
    path: PathBuf,
    steps: usize,
    batch_size: usize,
) -> Result<()> {
    let config = load_config(&config)?;
    let device = Device::from_gpu_id(config.primary_gpu());
    let table = EmbeddingTable::open(&path, &name, device)?;
    if persist::has_state(&path, &name) {
        table.load_state(&path, &name)?;
    }
    let num_embeddings = table.num_embeddings();
    if batch_size == 0 || batch_size > num_embeddings {
        return Err(anyhow!(
            "batch-size must be between 1 and {}, got {}",
            num_embeddings,
            batch_size
        ));
    }

    let mut emb = ExternalEmbedding::from_table(Arc::new(table), config.lr)?;
    if config.async_update {
        emb.create_async_update(config.num_thread)?;
    }
    let mut rng = StdRng::seed_from_u64(config.seed_for(&name) ^ emb.table().step());
    let start_step = emb.table().step();
    info!(steps, batch_size, async_update = config.async_update, "simulating");

    for _ in 0..steps {
        let indices = index::sample(&mut rng, num_embeddings, batch_size).into_vec();
        let rows = emb.read(&indices, None, true)?;
        if let Some(traced) = rows.traced() {
            traced.set_grad(traced.values().clone())?;
        }
        emb.update(None)?;
    }
    if config.async_update {
        let jobs_applied = emb.finish_async_update()?;
        info!(jobs_applied, "async updates flushed");
    }

    emb.save(&path, &name)?;
    emb.table().save_state(&path, &name)?;
    info!(
        start_step,
        end_step = emb.table().step(),
        "saved table and optimizer state"
    );
    println!("{}", jsonify(&table_stats(&name, emb.table(), true)?));
    Ok(())
}

fn table_stats(name: &str, table: &EmbeddingTable, with_state: bool) -> Result<TableStats> {
    let rows = table.to_array()?;
    let norms: Vec<f32> = rows
        .rows()
        .into_iter()
        .map(|row| row.dot(&row).sqrt())
        .collect();
    let (min, max, sum) = norms.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
        |(min, max, sum), &n| (min.min(n), max.max(n), sum + n as f64),
    );
    let (min, max, mean) = if norms.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        (min, max, (sum / norms.len() as f64) as f32)
    };
    Ok(TableStats {
        name: name.to_string(),
        num_embeddings: table.num_embeddings(),
        dim: table.dim(),
        step: with_state.then(|| table.step()),
        min_row_norm: min,
        mean_row_norm: mean,
        max_row_norm: max,
        accumulator_sum: with_state.then(|| table.accumulator().iter().map(|&v| v as f64).sum()),
    })
}
