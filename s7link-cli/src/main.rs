use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use s7link::{ConnectOptions, ConnectionType, ReadResult, ReturnCode, S7Client};
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Command-line S7 client.
///
/// Talks to Siemens S7 PLCs over ISO-on-TCP (port 102). Tags use the
/// `AREA.OFFSET[,TYPE[,COUNT]]` notation, e.g. `DB1.0,w,4` or `M10.2,x`.
#[derive(Parser)]
#[command(name = "s7link")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Read, write and watch S7 PLC tags", long_about = None)]
struct Cli {
    /// Target host (IPv4 or hostname)
    #[arg(short, long, env = "S7LINK_ADDRESS", global = true, default_value = "127.0.0.1")]
    address: String,

    /// CPU rack number
    #[arg(long, global = true, default_value_t = 0)]
    rack: u8,

    /// CPU slot number
    #[arg(long, global = true, default_value_t = 2)]
    slot: u8,

    /// Connection profile
    #[arg(long = "type", global = true, value_enum, default_value_t = Profile::Pg)]
    profile: Profile,

    /// Desired maximum PDU size; the PLC may shrink it
    #[arg(long, global = true, default_value_t = 960)]
    pdu_size: u16,

    /// Requested parallel job credit
    #[arg(long, global = true, default_value_t = 10)]
    jobs: u16,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true, default_value_t = 5000)]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Enable trace logging (overrides --debug)
    #[arg(long, global = true)]
    trace: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Profile {
    Pg,
    Op,
    Basic,
}

impl From<Profile> for ConnectionType {
    fn from(value: Profile) -> Self {
        match value {
            Profile::Pg => ConnectionType::Pg,
            Profile::Op => ConnectionType::Op,
            Profile::Basic => ConnectionType::Basic,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Read tags once
    Read {
        /// Pre-parse and cache the tag set before reading
        #[arg(long)]
        register: bool,
        /// Tags to read
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Write TAG=HEXVALUE pairs
    Write {
        /// Assignments like DB1.0,w,1=0102
        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Read tags repeatedly
    Watch {
        /// Number of rounds; 0 runs until interrupted
        #[arg(long, default_value_t = 0)]
        loops: u64,
        /// Delay between rounds in milliseconds
        #[arg(long, default_value_t = 1000)]
        wait: u64,
        /// Tags to read
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.trace {
        "s7link=trace,s7link_cli=trace"
    } else if cli.debug {
        "s7link=debug,s7link_cli=debug"
    } else {
        "s7link=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let options = ConnectOptions {
        address: cli.address.clone(),
        connection_type: cli.profile.into(),
        rack: cli.rack,
        slot: cli.slot,
        pdu_size: cli.pdu_size,
        max_parallel_jobs: cli.jobs,
        receive_timeout_ms: cli.timeout_ms,
        ..ConnectOptions::default()
    };
    let client = S7Client::connect(options).await?;

    let outcome = match &cli.command {
        Command::Read { register, tags } => {
            let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
            if *register {
                client.register(&tag_refs).await?;
            }
            let results = client.read(&tag_refs).await?;
            print_round(&tag_refs, &results, cli.json);
            Ok(())
        }
        Command::Write { assignments } => {
            let mut writes = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                let (tag, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| format!("missing '=' in '{assignment}'"))?;
                writes.push((tag, Bytes::from(parse_hex(value)?)));
            }
            let pairs: Vec<(&str, Bytes)> =
                writes.iter().map(|(t, d)| (*t, d.clone())).collect();
            let codes = client.write(&pairs).await?;
            let mut failed = false;
            for ((tag, _), code) in writes.iter().zip(&codes) {
                println!("{tag} = {code:?}");
                failed |= !matches!(code, ReturnCode::Success);
            }
            if failed {
                Err("at least one item was rejected".into())
            } else {
                Ok(())
            }
        }
        Command::Watch { loops, wait, tags } => {
            let tag_refs: Vec<&str> = tags.iter().map(String::as_str).collect();
            client.register(&tag_refs).await?;
            let mut round = 0u64;
            loop {
                let results = client.read(&tag_refs).await?;
                print_round(&tag_refs, &results, cli.json);
                round += 1;
                if *loops != 0 && round >= *loops {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(*wait)).await;
            }
            Ok(())
        }
    };

    client.disconnect().await;
    outcome
}

fn print_round(tags: &[&str], results: &[ReadResult], json: bool) {
    if json {
        let object: serde_json::Map<String, serde_json::Value> = tags
            .iter()
            .zip(results)
            .map(|(tag, result)| {
                let value = if matches!(result.return_code, ReturnCode::Success) {
                    serde_json::Value::String(hex_string(&result.data))
                } else {
                    serde_json::Value::Null
                };
                (tag.to_string(), value)
            })
            .collect();
        println!("{}", serde_json::Value::Object(object));
    } else {
        for (tag, result) in tags.iter().zip(results) {
            match result.return_code {
                ReturnCode::Success => println!("{tag} = {}", hex_string(&result.data)),
                code => println!("{tag} = <{code:?}>"),
            }
        }
    }
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02X}")).collect()
}

fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    let cleaned = value.trim_start_matches("0x").trim_start_matches("0X");
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return Err(format!("'{value}' is not an even-length hex string"));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|_| format!("'{value}' is not a hex string"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing_round_trips() {
        assert_eq!(parse_hex("0102ff").unwrap(), vec![0x01, 0x02, 0xFF]);
        assert_eq!(parse_hex("0xAB").unwrap(), vec![0xAB]);
        assert!(parse_hex("1").is_err());
        assert!(parse_hex("zz").is_err());
        assert_eq!(hex_string(&[0x01, 0xFF]), "01FF");
    }
}
