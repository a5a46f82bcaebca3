// One-shot client for the coordination façade: issues a single
// get/set/create/delete/session request against a running coord-server
// and prints the response.

use clap::{Parser, Subcommand};
use rusty_coord::server::protocol::{read_frame, write_frame, Request, Response};
use rusty_coord::Result;
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "coord-cli", about = "One-shot client for rusty-coord")]
struct Args {
    /// Address of a running coord-server's façade socket.
    #[arg(long, default_value = "127.0.0.1:7701")]
    server: std::net::SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the value at a key.
    Get { key: String },
    /// Create a new entry; fails if one already exists.
    Create { key: String, value: String },
    /// Create a new entry, or return the existing value.
    GetOrCreate { key: String, value: String },
    /// Replace the value at a key.
    Set {
        key: String,
        value: String,
        #[arg(long, default_value_t = 0)]
        expected_version: u64,
    },
    /// Mark a key deleted.
    Delete {
        key: String,
        #[arg(long, default_value_t = 0)]
        expected_version: u64,
        #[arg(long)]
        recursive: bool,
    },
    /// Print this client's local session identity, as seen by the server.
    Session,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let request = match args.command {
        Command::Get { key } => Request::Get { key },
        Command::Create { key, value } => Request::Create { key, value: value.into_bytes() },
        Command::GetOrCreate { key, value } => {
            Request::GetOrCreate { key, value: value.into_bytes() }
        }
        Command::Set { key, value, expected_version } => Request::SetValue {
            key,
            value: value.into_bytes(),
            expected_version,
        },
        Command::Delete { key, expected_version, recursive } => {
            Request::Delete { key, expected_version, recursive }
        }
        Command::Session => Request::GetSession,
    };

    let mut stream = TcpStream::connect(args.server).await?;
    write_frame(&mut stream, &request).await?;
    let response: Response = read_frame(&mut stream)
        .await?
        .ok_or_else(|| rusty_coord::CoordinationError::Network("server closed the connection".into()))?;

    print_response(response);
    Ok(())
}

fn print_response(response: Response) {
    match response {
        Response::Value(Some(bytes)) => println!("{}", String::from_utf8_lossy(&bytes)),
        Response::Value(None) => println!("(not found)"),
        Response::Entry(entry) => println!(
            "key={} version={} value={} write_lock={:?} read_locks={:?} deleted={}",
            entry.key,
            entry.storage_version,
            String::from_utf8_lossy(&entry.value),
            entry.write_lock,
            entry.read_locks,
            entry.is_marked_as_deleted,
        ),
        Response::Session(session) => println!("{session}"),
        Response::Error { kind, message } => {
            eprintln!("error: {kind}: {message}");
            std::process::exit(1);
        }
    }
}
