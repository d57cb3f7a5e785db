use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tsrelay::config::RelayConfig;
use tsrelay::destination::DestinationSpec;
use tsrelay::relay::{run, Options};

#[derive(Parser)]
#[clap(about = "Relay an RTP transport stream into a recording file or upload session")]
struct Opt {
    /// TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Only accept datagrams from this address
    #[clap(long)]
    remote: Option<IpAddr>,

    /// Local address to listen on (a multicast group is joined)
    #[clap(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    /// UDP port the tuner streams to
    #[clap(long)]
    port: u16,

    /// Record into this file
    #[clap(long, conflicts_with = "upload", required_unless_present = "upload")]
    output: Option<PathBuf>,

    /// Upload to this media server (`host` or `host:port`)
    #[clap(long, requires_all = ["upload_id", "filename"])]
    upload: Option<String>,

    #[clap(long)]
    upload_id: Option<u32>,

    /// File name on the media server
    #[clap(long)]
    filename: Option<String>,

    /// Circular recording: wrap to the start after this many bytes
    #[clap(long)]
    wrap_at: Option<u64>,

    /// Switch to a new numbered file every N seconds
    #[clap(long)]
    rotate_secs: Option<u64>,

    /// Refresh interval for the JSON status report
    #[clap(long, default_value_t = 2)]
    refresh: u64,
}

impl Opt {
    fn destination(&self) -> anyhow::Result<DestinationSpec> {
        if let Some(path) = &self.output {
            return Ok(DestinationSpec::LocalFile {
                path: path.clone(),
                wrap_at: self.wrap_at,
            });
        }
        match (&self.upload, self.upload_id, &self.filename) {
            (Some(server), Some(upload_id), Some(filename)) => Ok(DestinationSpec::RemoteUpload {
                server: server.clone(),
                filename: filename.clone(),
                upload_id,
                wrap_at: self.wrap_at,
            }),
            _ => anyhow::bail!("either --output or --upload with --upload-id and --filename is required"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let config = RelayConfig::load(opt.config.as_deref()).context("loading configuration")?;
    tsrelay::logging::init(&config.logging.level);

    run(Options {
        destination: opt.destination()?,
        config,
        remote: opt.remote,
        local: SocketAddr::new(opt.bind, opt.port),
        rotate_secs: opt.rotate_secs,
        refresh_secs: opt.refresh,
    })
    .await
}
