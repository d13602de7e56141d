//! Algorithm device bridge: a line-oriented text protocol over its own
//! serial port (spec §6). Holds no reference back to the microcontroller
//! controller (design note §9) — callers that need to bridge a result
//! into a dispense do so themselves.

use crate::config::AlgoConfig;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AlgoResponse {
    pub code: i64,
    pub msg: String,
    pub ident: String,
    pub function: String,
    pub bet: i64,
    pub prize: i64,
    pub algo: String,
    pub hp30: i64,
    pub win: i64,
    pub chk: String,
}

#[derive(Debug)]
pub enum AlgoError {
    Io(std::io::Error),
    Json(serde_json::Error),
    NoResponse,
}

impl std::fmt::Display for AlgoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "algo device I/O error: {e}"),
            Self::Json(e) => write!(f, "algo device response was not valid JSON: {e}"),
            Self::NoResponse => write!(f, "algo device closed the connection without a response"),
        }
    }
}

impl std::error::Error for AlgoError {}

impl From<std::io::Error> for AlgoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for AlgoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// One request/response exchange against the algorithm device. Each
/// call opens and closes its own connection; the device is low-rate
/// enough (one request per spin, plus an optional slow poll) that
/// holding a long-lived handle buys nothing here.
pub struct AlgoClient {
    config: AlgoConfig,
}

impl AlgoClient {
    pub fn new(config: AlgoConfig) -> Self {
        Self { config }
    }

    fn resolve_port(&self) -> Option<String> {
        if self.config.port != "auto" {
            return Some(self.config.port.clone());
        }
        serialport::available_ports()
            .ok()
            .and_then(|ports| ports.into_iter().next())
            .map(|p| p.port_name)
    }

    /// Send `algo -b <bet> -p <prize>` and parse the single-line JSON
    /// reply.
    pub async fn query(&self, bet: i64, prize: i64) -> Result<AlgoResponse, AlgoError> {
        let path = self.resolve_port().ok_or(AlgoError::NoResponse)?;
        let mut port = tokio_serial::new(&path, self.config.baud).open_native_async()?;

        let request = format!("algo -b {bet} -p {prize}\r\n");
        port.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(port);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(AlgoError::NoResponse);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Spawn a background task that polls `query` at the configured
    /// interval when `timer_enabled` is set. No-op otherwise.
    pub fn spawn_poller(self: std::sync::Arc<Self>, on_response: impl Fn(AlgoResponse) + Send + Sync + 'static) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.timer_enabled {
            return None;
        }
        let interval = self.config.interval;
        let bet = self.config.bet;
        let prize = self.config.prize;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.query(bet, prize).await {
                    Ok(resp) => on_response(resp),
                    Err(e) => warn!(error = %e, "algo device poll failed"),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_response_line() {
        let line = r#"{"code":0,"msg":"ok","ident":"A1","function":"spin","bet":1,"prize":100,"algo":"v2","hp30":30,"win":100,"chk":"abc"}"#;
        let resp: AlgoResponse = serde_json::from_str(line).unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(resp.win, 100);
    }
}
