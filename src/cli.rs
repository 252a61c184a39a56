use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "proxyhive", about, version)]
pub struct Cli {
    /// Time in seconds before giving up on a network operation
    #[arg(short, long, default_value_t = 8)]
    pub timeout: u64,

    /// The maximum number of concurrent proxy checks
    #[arg(long, default_value_t = 200)]
    pub max_conn: usize,

    /// The maximum number of attempts to check a proxy
    #[arg(long, default_value_t = 3)]
    pub max_tries: usize,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<log::LevelFilter>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Find proxies and validate protocols and anonymity
    Find {
        /// Protocols to validate: HTTP, HTTPS, CONNECT:80, CONNECT:25,
        /// SOCKS4, SOCKS5 (default: HTTP,HTTPS)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// The maximum number of working proxies (0 = unlimited)
        #[arg(short, long, default_value_t = 0)]
        limit: usize,

        /// Only keep proxies located in these ISO country codes
        #[arg(long, value_delimiter = ',')]
        countries: Vec<String>,

        /// Only keep HTTP proxies with these anonymity levels
        #[arg(long, value_delimiter = ',')]
        levels: Vec<String>,

        /// Probe judges with POST instead of GET
        #[arg(long)]
        post: bool,

        /// Only keep proxies that validated every requested type
        #[arg(long)]
        strict: bool,

        /// Verify judge TLS certificates
        #[arg(long)]
        verify_ssl: bool,

        /// Print proxies as JSON documents
        #[arg(long)]
        json: bool,
    },

    /// Scrape candidates from the providers without checking them
    Grab {
        /// The maximum number of proxies to emit (0 = unlimited)
        #[arg(short, long, default_value_t = 0)]
        limit: usize,

        /// Only keep proxies located in these ISO country codes
        #[arg(long, value_delimiter = ',')]
        countries: Vec<String>,

        /// Print proxies as JSON documents
        #[arg(long)]
        json: bool,
    },

    /// Run the rotating proxy server backed by a self-refilling pool
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = 8888)]
        port: u16,

        /// Protocols to validate for the pool (default: HTTP,HTTPS)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// Pool level under which the next grab cycle starts
        #[arg(long, default_value_t = 5)]
        min_queue: usize,

        /// Only keep proxies located in these ISO country codes
        #[arg(long, value_delimiter = ',')]
        countries: Vec<String>,

        /// Only keep HTTP proxies with these anonymity levels
        #[arg(long, value_delimiter = ',')]
        levels: Vec<String>,
    },
}
