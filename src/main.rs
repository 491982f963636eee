//! Runs a small query against two in-memory datasets and prints the rows.
//!
//! Configuration is read from `squall.toml` (or the file named by the first
//! argument) and `SQUALL_*` environment variables.

use std::env;
use std::process::ExitCode;

use tracing::error;
use tracing_subscriber::EnvFilter;

use squall::aggregate::{AggregateMetric, Comparison};
use squall::commands::Command;
use squall::config::EngineConfig;
use squall::docfilter::{DocFilter, DocMetric};
use squall::memory::{Document, MemoryDataset, MemoryEngine};
use squall::remote::Term;
use squall::session::{DatasetRequest, Session};

const HOUR: i64 = 3_600_000;

fn sample_engine() -> MemoryEngine {
    let countries = ["us", "ca", "gb"];
    let jobs = (0..48)
        .map(|i| {
            Document::builder(i * HOUR / 8)
                .string("country", countries[i as usize % 3])
                .int("clicks", i % 7)
                .build()
        })
        .collect();
    let ads = (0..30)
        .map(|i| Document::builder(i * HOUR / 5).string("cntry", countries[i as usize % 2]).int("clicks", 2).build())
        .collect();
    let mut engine = MemoryEngine::new();
    engine.add_dataset("jobsearch", MemoryDataset::new(jobs));
    engine.add_dataset("adsense", MemoryDataset::new(ads));
    engine
}

fn sample_commands() -> Vec<Command> {
    let clicks = |dataset: &str| AggregateMetric::doc_stats(dataset, &["clicks"]);
    vec![
        Command::filter_docs(DocFilter::negate(DocFilter::field_is("country", Term::Str("gb".to_string())))),
        Command::filter_docs(DocFilter::compare(Comparison::Lt, DocMetric::field("clicks"), DocMetric::Constant(6))),
        Command::time_regroup(2 * HOUR, "%Y-%m-%d %H:%M"),
        Command::StringRegroupFieldIn {
            field: "country".to_string(),
            terms: vec!["ca".to_string(), "us".to_string()],
            with_default: false,
        },
        Command::get_group_stats(vec![
            AggregateMetric::add(
                AggregateMetric::doc_stats("jobsearch", &["count()"]),
                AggregateMetric::doc_stats("adsense", &["count()"]),
            ),
            AggregateMetric::add(clicks("jobsearch"), clicks("adsense")),
        ]),
    ]
}

fn main() -> ExitCode {
    let path = env::args().nth(1);
    let config = match EngineConfig::load(Some(path.as_deref().unwrap_or("squall"))) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut engine = sample_engine();
    let datasets = vec![
        DatasetRequest::new("jobsearch", 0, 6 * HOUR),
        DatasetRequest::new("adsense", 0, 6 * HOUR).with_alias("country", "cntry"),
    ];
    match Session::create(&mut engine, datasets, sample_commands(), &config) {
        Ok(result) => {
            for row in &result.rows {
                println!("{}", row);
            }
            eprintln!("{}", result.timings);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, user_facing = e.is_user_facing(), "query failed");
            ExitCode::FAILURE
        }
    }
}
