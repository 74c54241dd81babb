use anyhow::Result;

use clap::Parser;
use depth2video::{run, Args};

fn main() -> Result<()> {
    let args = Args::parse();
    run(args)
}
