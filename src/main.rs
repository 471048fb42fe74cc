//! Docker Image Replicator
//!
//! Entry point: parses arguments, runs the selected command and maps the result
//! to the process exit code (0 success or nothing to do, 1 fatal setup error,
//! 2 failed units, 130 paused by a shutdown signal).

use anyhow::Context;
use clap::Parser;
use docker_image_replicator::cli::runner::EXIT_FATAL;
use docker_image_replicator::cli::{Args, Runner};
use std::process;

#[tokio::main]
async fn main() {
    let runner = Runner::new(Args::parse());

    match run(&runner).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            runner.output().error(&format!("{:#}", e));
            process::exit(EXIT_FATAL);
        }
    }
}

async fn run(runner: &Runner) -> anyhow::Result<i32> {
    runner.run().await.context("docker-image-replicator failed")
}
