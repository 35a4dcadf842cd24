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

use clap::{Parser, Subcommand};
use streamlog::raft::{IndexedEntry, MetaStore, RaftEntry};
use streamlog::storage::RecordIter;
use streamlog::AppResult;

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every entry of a journal segment file
    Segment {
        #[arg(short, long)]
        file: PathBuf,
        /// also print the records inside application entries
        #[arg(short, long)]
        records: bool,
    },
    /// Print term and commit index of a meta file
    Meta {
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Segment { file, records } => dump_segment(file, *records),
        Commands::Meta { file } => dump_meta(file).await,
    }
}

/// Reads the file without opening it as a segment, which would truncate a torn tail.
fn dump_segment(file: &PathBuf, with_records: bool) -> AppResult<()> {
    let data = std::fs::read(file)?;
    println!("segment {:?}, {} bytes", file, data.len());

    let mut offset = 0;
    while offset < data.len() {
        let (entry, size) = match IndexedEntry::decode(&data[offset..]) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                println!("torn entry at byte {}, {} bytes left", offset, data.len() - offset);
                break;
            }
            Err(e) => {
                println!("corrupt entry at byte {}: {}", offset, e);
                break;
            }
        };
        print_entry(&entry, offset, with_records);
        offset += size;
    }
    Ok(())
}

fn print_entry(entry: &IndexedEntry, offset: usize, with_records: bool) {
    match entry.entry() {
        RaftEntry::Initial => println!(
            "@{} index {} term {} initial",
            offset,
            entry.index(),
            entry.term()
        ),
        RaftEntry::Configuration(configuration) => println!(
            "@{} index {} term {} configuration members {:?}",
            offset,
            entry.index(),
            entry.term(),
            configuration.members
        ),
        RaftEntry::Application(application) => {
            println!(
                "@{} index {} term {} application positions [{}, {}] {} bytes",
                offset,
                entry.index(),
                entry.term(),
                application.lowest_position,
                application.highest_position,
                application.data.len()
            );
            if with_records {
                for record in RecordIter::new(application.data.clone()) {
                    match record {
                        Ok(record) => println!(
                            "    position {} key {} value {}",
                            record.position,
                            record.key,
                            String::from_utf8_lossy(&record.value)
                        ),
                        Err(e) => {
                            println!("    malformed record: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn dump_meta(file: &PathBuf) -> AppResult<()> {
    let meta = MetaStore::new(file).load().await?;
    println!("meta {:?}: term {}, commit index {}", file, meta.term, meta.commit_index);
    Ok(())
}
