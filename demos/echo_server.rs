//! Echo server on both protocols.
//!
//! Demonstrates:
//! - Loading listener configuration from a property file
//! - Running an RTCP and an HTTP listener side by side
//! - Answering client messages through a `SessionHandle`
//!
//! Usage:
//!   cargo run --example echo_server
//!   cargo run --example echo_server -- --debug
//!   cargo run --example echo_server -- --config server.properties
//!
//! Try it:
//!   printf 'start\n1 0\n"hello"\n\n' | nc localhost 7000
//!   curl http://localhost:7080/connect

// ============================================================================
// Imports
// ============================================================================

use anyhow::{Context, Result};
use resumable_session::{
    HttpConfig, MessageHandler, Payload, Properties, RtcpConfig, SessionHandle, http, rtcp,
};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const RTCP_ADDR: &str = "0.0.0.0:7000";
const HTTP_ADDR: &str = "0.0.0.0:7080";

// ============================================================================
// Arguments
// ============================================================================

struct Args {
    debug: bool,
    config: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            debug: false,
            config: None,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--debug" => parsed.debug = true,
                "--config" => parsed.config = args.next(),
                _ => {}
            }
        }
        parsed
    }
}

// ============================================================================
// Handler
// ============================================================================

struct Echo {
    session: SessionHandle,
}

impl MessageHandler for Echo {
    fn process_message(&mut self, message: Value) {
        info!(session_id = %self.session.id(), %message, "Echoing");
        let _ = self.session.send(Payload::from(message));
    }

    fn connection_died(&mut self, reason: &str) {
        info!(session_id = %self.session.id(), reason, "Session over");
    }
}

fn echo(session: SessionHandle) -> Box<dyn MessageHandler> {
    Box::new(Echo { session })
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "resumable_session=debug"
    } else {
        "resumable_session=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    let props = match &args.config {
        Some(path) => {
            Properties::load(path).with_context(|| format!("loading {path}"))?
        }
        None => Properties::new(),
    };

    let rtcp_config = RtcpConfig::from_properties(&props)?;
    let http_config = HttpConfig::from_properties(&props, "conf.echo")?;

    let rtcp_server = rtcp::listen(RTCP_ADDR, rtcp_config, echo).await?;
    let http_server = http::listen(HTTP_ADDR, http_config, echo).await?;

    println!("RTCP listening on {}", rtcp_server.local_addr());
    println!("HTTP listening on {}", http_server.local_addr());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    rtcp_server.shutdown();
    http_server.shutdown();
    Ok(())
}
