//! CLI/env configuration: a `clap::Parser` derive struct with `env`
//! fallbacks for every field so the binary runs the same way under a
//! process manager or a shell.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "swarmcast-node", about = "Swarmcast CDN fabric node")]
pub struct Args {
    /// Address this node's gRPC server binds to.
    #[arg(long, env = "SWARMCAST_LISTEN_ADDRESS", default_value = "0.0.0.0:50051")]
    pub listen_address: String,

    /// Address this node advertises to peers (the directory and
    /// `Traverse`/`Resolve` responses use this, not the bind address).
    #[arg(long, env = "SWARMCAST_INBOUND_ADDRESS")]
    pub inbound_address: Option<String>,

    /// Comma-separated STUN/TURN server URLs for the WebRTC ICE agent.
    #[arg(
        long,
        env = "SWARMCAST_ICE_SERVERS",
        default_value = "stun:stun.l.google.com:19302",
        value_delimiter = ','
    )]
    pub ice_servers: Vec<String>,

    /// Skip DHT bootstrap and use an in-process directory instead, for
    /// local development and integration tests.
    #[arg(long, env = "SWARMCAST_IN_MEMORY_DIRECTORY", default_value_t = false)]
    pub in_memory_directory: bool,

    /// An initial DHT peer (`host:port`), supplied in addition to the
    /// DHT library's own default bootstrap set. Repeatable.
    #[arg(long, env = "SWARMCAST_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// A peer (`host:port`) to dial at startup via its `Resolve` RPC, to
    /// learn a reachable address before this node announces itself.
    #[arg(long, env = "SWARMCAST_PROBE")]
    pub probe: Option<String>,

    /// Log filter, passed straight to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn inbound_address(&self) -> String {
        self.inbound_address
            .clone()
            .unwrap_or_else(|| self.listen_address.clone())
    }
}
