use std::io::{self, Write};

use bstore::{Key128, Store, LS_ASYNC_COMMIT};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty store file.
    Create {
        path: String,
    },
    /// Insert a key with a value read from stdin or a file.
    Put {
        path: String,
        hi: u64,
        lo: u64,
        /// Value source; `-` reads from stdin.
        value: String,
        /// Defer the commit flush (requires a later `commit`, not yet
        /// wired into this binary; mostly useful for benchmarking).
        #[arg(long)]
        async_commit: bool,
    },
    /// Print a key's value to stdout.
    Get { path: String, hi: u64, lo: u64 },
    /// Print every key in ascending order with its value's size and hash.
    Walk { path: String },
    /// Print store identity, key count, flags, and root offset.
    Stat { path: String },
}

fn main() -> io::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Create { path } => {
            Store::create(path)?;
            Ok(())
        }
        Command::Put {
            path,
            hi,
            lo,
            value,
            async_commit,
        } => {
            let store = Store::open(path, true)?;
            if async_commit {
                store.set_flag(LS_ASYNC_COMMIT);
            }
            let key = Key128::new(hi, lo);
            if value == "-" {
                store.put(key, io::stdin().lock())?;
            } else {
                store.put(key, std::fs::File::open(value)?)?;
            }
            store.close()
        }
        Command::Get { path, hi, lo } => {
            let store = Store::open(path, false)?;
            let reader = store.get(Key128::new(hi, lo))?;
            io::stdout().write_all(&reader.read_to_vec()?)
        }
        Command::Walk { path } => {
            let store = Store::open(path, false)?;
            store.walk(|key, reader| {
                println!(
                    "({}, {}) -> {} bytes, hash {:#018x}",
                    key.hi,
                    key.lo,
                    reader.size(),
                    reader.pair().hash
                );
                // Drain without materializing the payload; size/hash above
                // already came from the index entry.
                let mut sink = io::sink();
                let mut reader = reader;
                io::copy(&mut reader, &mut sink)?;
                Ok(())
            })
        }
        Command::Stat { path } => {
            let store = Store::open(path, false)?;
            let created_at = store.created_at();
            println!("Store ID: {}", store.store_id());
            println!(
                "Creation time: {}",
                chrono::DateTime::from_timestamp(
                    (created_at / 1_000_000_000) as i64,
                    (created_at % 1_000_000_000) as u32,
                )
                .unwrap()
                .format("%Y-%m-%d %H:%M:%S")
            );
            println!("Keys: {}", store.count());
            println!("Flags: {:#x}", store.flags());
            println!("Root offset: {}", store.root_offset());
            Ok(())
        }
    }
}
