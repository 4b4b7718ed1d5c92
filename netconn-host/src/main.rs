// netconn host: opens one connection with the engine and copies what it receives to stdout.

mod config;
mod driver;

use std::io::Write;

use anyhow::{anyhow, bail, Context};
use netconn_core::{ConnError, ConnEvent, ConnHandle};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::driver::Driver;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut url = None;
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("netconn-host {}", VERSION);
            return Ok(());
        }
        url.get_or_insert(arg);
    }
    let Some(url) = url else {
        eprintln!("usage: netconn-host <socket://host:port | http://host[:port]/path>");
        std::process::exit(2);
    };

    let cfg = config::load();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        tokio::select! {
            r = run(&url, &cfg) => r,
            r = shutdown_signal() => {
                tracing::info!("interrupted");
                r
            }
        }
    })
}

async fn run(url: &str, cfg: &Config) -> anyhow::Result<()> {
    let mut driver = Driver::new(cfg.engine.clone());
    let handle = driver
        .engine_mut()
        .connect(url)
        .map_err(|e| anyhow!("{}: {} ({})", url, e, e.code()))?;
    let connected = next(&mut driver).await?;
    let result = connected
        .outcome()
        .map_err(|e| anyhow!("connect {}: {} ({})", url, e, e.code()))?;

    match driver.engine().http_response_headers(handle) {
        Ok(headers) => {
            eprintln!("status {}", result);
            for (key, value) in headers.iter() {
                eprintln!("{}: {}", key, value);
            }
        }
        Err(_) => {
            if let Some(remote) = driver.engine().remote_endpoint(handle) {
                eprintln!("connected to {}", remote);
            }
        }
    }

    copy_to_stdout(&mut driver, handle, cfg.read_chunk).await?;
    driver.engine_mut().shutdown();
    while next(&mut driver).await.is_ok() {}
    Ok(())
}

/// Read until the peer closes.
async fn copy_to_stdout(driver: &mut Driver, handle: ConnHandle, chunk: usize) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    let mut total = 0usize;
    loop {
        driver.engine_mut().read(handle, chunk)?;
        let event = next(driver).await?;
        match event.outcome() {
            Ok(_) => {
                let data = event.data.unwrap_or_default();
                total += data.len();
                stdout.write_all(&data).context("write stdout")?;
            }
            Err(ConnError::Closed) => break,
            Err(e) => bail!("read: {} ({})", e, e.code()),
        }
    }
    stdout.flush()?;
    tracing::debug!(bytes = total, "peer closed");
    Ok(())
}

async fn next(driver: &mut Driver) -> anyhow::Result<ConnEvent> {
    driver
        .next_event()
        .await
        .ok_or_else(|| anyhow!("engine idle with no event"))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
