use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

use shoreline_client::call::{self, CallHandle, CallSnapshot, CallState};
use shoreline_client::cli::{Cli, Command};
use shoreline_client::logging;
use shoreline_client::media::{MediaGuard, SyntheticCapture};
use shoreline_client::transport::webrtc::RtcTransportFactory;
use shoreline_client::{ClientConfig, SignalingClient};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let (config, log, command) = Cli::parse().into_parts();
    if let Err(err) = logging::init(&log) {
        eprintln!("logging disabled: {err}");
    }
    if let Err(err) = run(config, command).await {
        error!("shoreline failed: {err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(config: ClientConfig, command: Command) -> anyhow::Result<()> {
    config.validate()?;
    let media = Arc::new(MediaGuard::new(
        Arc::new(SyntheticCapture),
        config.constraints.clone(),
    ));
    let factory = Arc::new(RtcTransportFactory::new(config.ice.clone()).context("building WebRTC stack")?);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (handle, controller) = call::spawn(config.call_options(), factory, media, outbound_tx);

    let mut signaling = SignalingClient::connect(&config.relay_url, &config.identity, outbound_rx, handle.clone())
        .await
        .context("connecting to relay")?;
    println!("registered as {} ({})", signaling.identity(), signaling.channel());

    let (dialing, auto_accept) = match &command {
        Command::Dial { target } => {
            handle.initiate(target.clone())?;
            (true, false)
        }
        Command::Listen { auto_accept } => {
            println!("waiting for calls; commands: a=accept r=reject h=hang up m=mute v=video q=quit");
            (false, *auto_accept)
        }
    };

    let mut snapshots = handle.subscribe();
    let mut last = snapshots.borrow_and_update().state;
    let mut was_active = dialing;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if snapshot.state == last {
                    continue;
                }
                last = snapshot.state;
                report(&snapshot);
                match snapshot.state {
                    CallState::Incoming if auto_accept => handle.accept()?,
                    CallState::Calling | CallState::InCall | CallState::Incoming => was_active = true,
                    CallState::Idle | CallState::Error if dialing && was_active => break,
                    _ => {}
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !command_line(&handle, line.trim())? {
                            break;
                        }
                    }
                    _ => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; hanging up");
                break;
            }
            _ = signaling.closed() => {
                println!("relay connection closed");
                break;
            }
        }
    }

    handle.hang_up()?;
    handle
        .wait_until(std::time::Duration::from_secs(2), |s| s.state == CallState::Idle)
        .await;
    drop(handle);
    signaling.close().await;
    let _ = controller.await;
    Ok(())
}

/// Applies one interactive command. Returns `false` to quit.
fn command_line(handle: &CallHandle, line: &str) -> anyhow::Result<bool> {
    match line {
        "a" => handle.accept()?,
        "r" => handle.reject()?,
        "h" => handle.hang_up()?,
        "m" => println!("audio {}", if handle.toggle_audio() { "on" } else { "off" }),
        "v" => println!("video {}", if handle.toggle_video() { "on" } else { "off" }),
        "q" => return Ok(false),
        "" => {}
        other => println!("unknown command {other:?}"),
    }
    Ok(true)
}

fn report(snapshot: &CallSnapshot) {
    let peer = snapshot.remote_user.as_deref().unwrap_or("-");
    match (&snapshot.state, &snapshot.error) {
        (CallState::Error, Some(message)) => println!("[error] {message}"),
        (CallState::Incoming, _) => println!("[incoming] call from {peer} (a=accept, r=reject)"),
        (state, _) => println!("[{state}] {peer}"),
    }
}
