// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::Parser;
use streamlog::{setup_tracing, AppError, AppResult, Broker, BrokerConfig, GLOBAL_CONFIG};
use tokio::runtime;
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory of the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// Print the effective configuration and exit
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing(&commandline.log_dir, commandline.verbose);

    //setup config
    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let broker_config = BrokerConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", broker_config);
        return Ok(());
    }
    GLOBAL_CONFIG
        .set(broker_config)
        .map_err(|_| AppError::IllegalStateError("broker config already set".to_string()))?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("streamlog-worker")
        .enable_all()
        .build()?;

    let mut broker = Broker::new();
    broker.start(&rt)?;
    info!("bye");
    Ok(())
}
