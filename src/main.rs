//! Terminal-Oberfläche für voxcall
//!
//! Zeigt Call-Events an und übersetzt Eingabezeilen in Engine-Aufrufe.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use voxcall::call_engine::{AudioDevice, CallEngine, CallEvent, CallState};
use voxcall::config::Config;
use voxcall::App;

const HELP: &str = "commands: call <jid> | cancel | accept [id] | reject [id] | hangup | msg <jid> <text> | status | quit";

#[derive(Debug, Parser)]
#[command(name = "voxcall", about = "Voice calls over an XMPP message relay")]
struct Args {
    /// Konfigurationsdatei (Standard: Benutzer-Konfigurationsverzeichnis)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Eigene JID
    #[arg(long)]
    jid: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// WebSocket-URL des Relays
    #[arg(long)]
    relay: Option<String>,

    /// Unverschlüsselte Verbindung (ws:// statt wss://)
    #[arg(long)]
    notls: bool,

    #[arg(long)]
    debug: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(jid) = &self.jid {
            config.xmpp.user = jid.clone();
        }
        if let Some(password) = &self.password {
            config.xmpp.password = password.clone();
        }
        if let Some(relay) = &self.relay {
            config.xmpp.relay_url = Some(relay.clone());
        }
        config.xmpp.no_tls |= self.notls;
        config.xmpp.debug |= self.debug;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);
    voxcall::init_logging(config.xmpp.debug);

    let mut app = App::new(&config).context("invalid configuration")?;
    let engine = Arc::clone(app.engine());

    app.start_signaling();
    app.start_frame_sender()
        .context("failed to start frame sender")?;

    // Ohne Audio-Gerät läuft nur die Signalisierung
    let _audio = match app.audio_pipeline().and_then(AudioDevice::start) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::error!("Audio unavailable: {}", e);
            None
        }
    };

    tokio::spawn(print_events(Arc::clone(&engine)));

    println!("Welcome to voxcall, {}!", config.xmpp.user);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !handle_command(&engine, line.trim()) {
            break;
        }
    }

    // Laufenden Anruf sauber beenden
    if engine.session().is_active() {
        let _ = engine.hang_up();
    }
    app.shutdown().await;
    Ok(())
}

/// Gibt `false` zurück, wenn das Programm beendet werden soll
fn handle_command(engine: &Arc<CallEngine>, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();
    let rest = parts.next();

    let result = match (command, arg) {
        ("", _) => Ok(()),
        ("call", Some(jid)) => {
            let engine = Arc::clone(engine);
            let jid = jid.to_string();
            // call() wartet bis zum Setup-Timeout
            tokio::spawn(async move {
                let _ = engine.call(&jid).await;
            });
            Ok(())
        }
        ("cancel", _) => match engine.state() {
            CallState::CallingOut { request_id, .. } => engine.abort_outgoing_call(&request_id),
            _ => {
                println!("no outgoing call");
                Ok(())
            }
        },
        ("accept", id) => match id.map(str::to_string).or_else(|| ringing_id(engine)) {
            Some(id) => engine.accept_call(&id).map(|_| ()),
            None => {
                println!("no incoming call");
                Ok(())
            }
        },
        ("reject", id) => match id.map(str::to_string).or_else(|| ringing_id(engine)) {
            Some(id) => engine.reject_call(Some(&id)),
            None => engine.reject_call(None),
        },
        ("hangup", _) => engine.hang_up(),
        ("msg", Some(jid)) => engine.send_chat(jid, rest.unwrap_or_default()),
        ("status", _) => {
            println!("{:?}", engine.state());
            Ok(())
        }
        ("quit" | "exit", _) => return false,
        _ => {
            println!("{}", HELP);
            Ok(())
        }
    };

    if let Err(e) = result {
        println!("error: {}", e);
    }
    true
}

fn ringing_id(engine: &CallEngine) -> Option<String> {
    match engine.state() {
        CallState::RingingIn { request_id, .. } => Some(request_id),
        _ => None,
    }
}

async fn print_events(engine: Arc<CallEngine>) {
    let mut events = engine.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} call events", n);
                continue;
            }
            Err(_) => break,
        };

        match event {
            CallEvent::Calling { peer, .. } => println!("Calling {}...  (cancel)", peer),
            CallEvent::IncomingCall { peer, request_id } => {
                println!("Incoming call from {}  (accept {} | reject {})", peer, request_id, request_id)
            }
            CallEvent::IncomingCallWithdrawn { peer, .. } => {
                println!("Missed call from {}", peer)
            }
            CallEvent::CallActive { peer } => println!("Talking with {}  (hangup)", peer),
            CallEvent::CallEnded { peer, reason } => println!("Call with {} ended: {}", peer, reason),
            CallEvent::ChatMessage {
                peer,
                text,
                received_at,
            } => println!("({}) {}: {}", received_at.format("%H:%M:%S"), peer, text),
        }
    }
}
