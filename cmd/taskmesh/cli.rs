use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "taskmesh", author, version, about = "taskmesh network node")]
pub struct Options {
    /// Chain specification file.
    #[arg(long, value_name = "PATH")]
    pub genesis: PathBuf,

    /// Directory for node data.
    #[arg(long, value_name = "PATH", default_value = "./taskmesh-data")]
    pub base_path: PathBuf,

    /// Directory for the key-value database.
    #[arg(long, value_name = "PATH")]
    pub rocksdb_path: Option<PathBuf>,

    /// Listen port for peer connections.
    #[arg(long, value_name = "N", default_value_t = 30333)]
    pub p2p_port: u16,

    /// HTTP RPC listen endpoint.
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:9933")]
    pub rpc_http_endpoint: String,

    /// WebSocket RPC listen endpoint.
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:9944")]
    pub rpc_ws_endpoint: String,

    /// Log level.
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"],
    )]
    pub verbosity: String,
}
