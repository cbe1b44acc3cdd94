use clap::Args;
use duration_string::DurationString;
use envsample::{Codec, Dataset, Dispatcher, DispatcherConfig, JsonCodec, Observation, PointBudget};
use eyre::Result;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::io::{create_output, open_input};

#[derive(Args, Debug)]
pub struct Opts {
    /// Value key to downsample (repeatable)
    #[clap(long = "key", short = 'k', required = true)]
    pub keys: Vec<String>,

    /// Maximum number of points per key, or "infinity"
    #[clap(long, default_value = "1000", value_parser = parse_budget)]
    pub threshold: PointBudget,

    /// Per-request timeout [0s = wait forever]
    #[clap(long, default_value = "30s")]
    pub timeout: DurationString,

    /// Sample on the calling thread instead of the background worker
    #[clap(long, default_value_t = false)]
    pub sync: bool,

    /// Output file [default: stdout]
    #[clap(long, default_value = "stdout")]
    pub output: String,

    /// Input files of newline delimited JSON observations [default: stdin]
    pub files: Vec<String>,
}

fn parse_budget(s: &str) -> Result<PointBudget, String> {
    s.parse().map_err(|e: eyre::Report| e.to_string())
}

#[derive(Serialize)]
struct SampledSeries<'a> {
    value_key: &'a str,
    original_length: usize,
    sampled_length: usize,
    sampled: &'a [Arc<Observation>],
}

pub async fn sample(opts: &Opts) -> Result<()> {
    let sources: Vec<String> = if opts.files.is_empty() {
        vec!["stdin".to_string()]
    } else {
        opts.files.clone()
    };

    let mut records: Vec<Observation> = Vec::new();
    for source in &sources {
        let mut input = open_input(source).await?;
        loop {
            match JsonCodec.decode(&mut input).await {
                Ok(obs) => records.push(obs),
                Err(e) if e.to_string() == "EOF" => break,
                Err(e) => eyre::bail!("decoding {}: {}", source, e),
            }
        }
    }

    if records.is_empty() {
        eyre::bail!("no observations to sample");
    }

    // The sampler works on index order, so series must be sorted by time.
    records.sort_by_key(|obs| obs.timestamp);
    let data: Dataset = records.into_iter().map(Arc::new).collect();

    let dispatcher = Dispatcher::new(DispatcherConfig {
        use_worker: !opts.sync,
        request_timeout: Some(opts.timeout.into()),
        ..Default::default()
    });

    let runs = opts
        .keys
        .iter()
        .map(|key| dispatcher.sample_async(data.clone(), opts.threshold, key));
    let results = join_all(runs).await;

    let mut output = create_output(&opts.output).await?;
    for (key, result) in opts.keys.iter().zip(results) {
        let sampled = result?;
        tracing::info!(
            key = key.as_str(),
            original = data.len(),
            sampled = sampled.len(),
            budget = %opts.threshold,
            "sampled series"
        );
        let row = SampledSeries {
            value_key: key,
            original_length: data.len(),
            sampled_length: sampled.len(),
            sampled: &sampled,
        };
        output.write_all(&serde_json::to_vec(&row)?).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await?;

    Ok(())
}
