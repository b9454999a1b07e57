//! Entry point for the **barlink** daemon.
//!
//! Connects to the window manager and to MPD from a single thread and
//! prints one line per state change, the way a text status bar would
//! consume it.  Both connections are kept alive across daemon restarts.
//!
//! When the `glib-reactor` feature is enabled the clients are driven by a
//! GLib main loop (what a GTK bar runs anyway).  Without the feature, the
//! built-in poll reactor is used instead.
//!
//! Flags: `--i3-only`, `--mpd-only`.

use barlink::client::Client;
use barlink::config::{ClientConfig, Config, I3Config, MpdConfig};
use barlink::error::ClientError;
use barlink::i3::{EventKind, I3Client, I3Codec, I3Event, I3Request, MessageType};
use barlink::mpd::{MpdClient, MpdCodec, MpdRequest, MpdResponse};
use barlink::traits::Reactor;
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::cell::RefCell;
use std::rc::Rc;

/// Resolve the config directory (`$XDG_CONFIG_HOME/barlink`).
fn config_dir() -> std::path::PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        format!("{}/.config", home)
    });
    std::path::PathBuf::from(base).join("barlink")
}

/// Try to load the config from `$XDG_CONFIG_HOME/barlink/config.json`,
/// falling back to compiled-in defaults.
fn load_config() -> Config {
    let path = config_dir().join("config.json");
    match Config::load(&path) {
        Ok(cfg) => {
            info!("loaded config from {}", path.display());
            cfg
        }
        Err(e) => {
            info!("no config file ({}), using defaults", e);
            Config::default()
        }
    }
}

// ── Main ──

fn main() {
    env_logger::init();

    let i3_only = std::env::args().any(|a| a == "--i3-only");
    let mpd_only = std::env::args().any(|a| a == "--mpd-only");
    if i3_only && mpd_only {
        error!("--i3-only and --mpd-only are mutually exclusive");
        std::process::exit(2);
    }

    let config = load_config();
    let reactor = new_reactor();

    let i3 = if mpd_only {
        None
    } else {
        start_i3(reactor.clone(), &config.client, &config.i3)
    };
    let mpd = if i3_only {
        None
    } else {
        start_mpd(reactor.clone(), &config.client, &config.mpd)
    };
    if i3.is_none() && mpd.is_none() {
        error!("nothing to connect to");
        std::process::exit(1);
    }

    start_event_loop(&reactor);

    if let Some(i3) = i3 {
        i3.destroy();
    }
    if let Some(mpd) = mpd {
        mpd.destroy();
    }
}

// ── Event loops ──

#[cfg(feature = "glib-reactor")]
type DaemonReactor = barlink::reactor::glib::GlibReactor;

#[cfg(not(feature = "glib-reactor"))]
type DaemonReactor = barlink::reactor::poll::PollReactor;

fn new_reactor() -> Rc<DaemonReactor> {
    Rc::new(DaemonReactor::new())
}

#[cfg(feature = "glib-reactor")]
fn start_event_loop(reactor: &Rc<DaemonReactor>) {
    reactor.run();
}

#[cfg(not(feature = "glib-reactor"))]
fn start_event_loop(reactor: &Rc<DaemonReactor>) {
    info!("barlink running");
    if let Err(e) = reactor.run() {
        error!("event loop failed: {}", e);
        std::process::exit(1);
    }
    info!("nothing left to watch, exiting");
}

// ── i3 feed ──

#[derive(Debug, Deserialize)]
struct Workspace {
    name: String,
    #[serde(default)]
    focused: bool,
    #[serde(default)]
    urgent: bool,
}

fn workspace_line(workspaces: &[Workspace]) -> String {
    let labels: Vec<String> = workspaces
        .iter()
        .map(|ws| match (ws.focused, ws.urgent) {
            (true, _) => format!("[{}]", ws.name),
            (false, true) => format!("{}!", ws.name),
            (false, false) => ws.name.clone(),
        })
        .collect();
    format!("workspaces: {}", labels.join(" "))
}

fn start_i3(reactor: Rc<dyn Reactor>, client: &ClientConfig, i3: &I3Config) -> Option<I3Client> {
    let endpoint = match i3.endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("cannot locate the i3 socket: {}", e);
            return None;
        }
    };
    let i3_client = Client::new(reactor, endpoint, client.clone(), I3Codec::new(i3.max_payload));

    i3_client.on_ready({
        let i3_client = i3_client.clone();
        move || {
            let events = [EventKind::Workspace, EventKind::BarconfigUpdate]
                .map(|k| k.name().unwrap_or_default());
            i3_client.command(I3Request::subscribe(&events), |reply| match reply {
                Ok(reply) if reply.payload["success"] == true => info!("subscribed to i3 events"),
                Ok(reply) => warn!("i3 refused the subscription: {}", reply.payload),
                Err(e) => warn!("i3 subscription failed: {}", e),
            });
            refresh_workspaces(&i3_client);
        }
    });

    i3_client.subscribe({
        let i3_client = i3_client.clone();
        move |event: &I3Event| match event.kind {
            EventKind::Workspace => {
                let change = event.payload["change"].as_str().unwrap_or_default();
                if matches!(change, "focus" | "urgent" | "init" | "empty" | "rename") {
                    refresh_workspaces(&i3_client);
                }
            }
            EventKind::BarconfigUpdate => info!("bar configuration changed"),
            other => debug!("ignoring i3 event {:?}", other),
        }
    });

    i3_client.connect();
    Some(i3_client)
}

fn refresh_workspaces(i3_client: &I3Client) {
    i3_client.command(I3Request::query(MessageType::GetWorkspaces), |reply| {
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!("workspace query failed: {}", e);
                return;
            }
        };
        match serde_json::from_value::<Vec<Workspace>>(reply.payload) {
            Ok(workspaces) => println!("{}", workspace_line(&workspaces)),
            Err(e) => warn!("unexpected workspace list: {}", e),
        }
    });
}

// ── MPD feed ──

fn now_playing_line(status: &MpdResponse, song: &MpdResponse) -> String {
    let state = status.get("state").unwrap_or("stop");
    if state == "stop" {
        return "mpd: stopped".into();
    }
    let title = song
        .get("Title")
        .or_else(|| song.get("file"))
        .unwrap_or("unknown");
    match song.get("Artist") {
        Some(artist) => format!("mpd: [{}] {} - {}", state, artist, title),
        None => format!("mpd: [{}] {}", state, title),
    }
}

fn start_mpd(
    reactor: Rc<dyn Reactor>,
    client: &ClientConfig,
    mpd: &MpdConfig,
) -> Option<MpdClient> {
    let endpoint = match mpd.endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("cannot locate MPD: {}", e);
            return None;
        }
    };
    let codec = MpdCodec::new(mpd.greeting.clone(), mpd.interrupt_idle, mpd.max_line);
    let mpd_client = Client::new(reactor, endpoint, client.clone(), codec);

    mpd_client.on_ready({
        let mpd_client = mpd_client.clone();
        move || {
            refresh_now_playing(&mpd_client);
            idle_loop(&mpd_client);
        }
    });

    mpd_client.connect();
    Some(mpd_client)
}

/// Wait for player changes, refresh, and wait again.  The loop ends with
/// the connection and is restarted by the ready handler.
fn idle_loop(mpd_client: &MpdClient) {
    let next = mpd_client.clone();
    mpd_client.command(MpdRequest::new("idle").arg("player"), move |reply| match reply {
        Ok(reply) => {
            if reply.get_all("changed").any(|s| s == "player") {
                refresh_now_playing(&next);
            }
            idle_loop(&next);
        }
        Err(ClientError::Protocol(e)) => {
            warn!("idle rejected: {}", e);
            idle_loop(&next);
        }
        // A timed-out idle may still be pending on the server.
        Err(e) => debug!("idle loop stopped: {}", e),
    });
}

fn refresh_now_playing(mpd_client: &MpdClient) {
    // Both requests are pipelined; `status` always resolves first.
    let status = Rc::new(RefCell::new(None));
    mpd_client.command(MpdRequest::new("status"), {
        let status = status.clone();
        move |reply| match reply {
            Ok(reply) => *status.borrow_mut() = Some(reply),
            Err(e) => warn!("MPD status failed: {}", e),
        }
    });
    mpd_client.command(MpdRequest::new("currentsong"), move |song| {
        let Some(status) = status.borrow_mut().take() else {
            return;
        };
        match song {
            Ok(song) => println!("{}", now_playing_line(&status, &song)),
            Err(e) => warn!("MPD currentsong failed: {}", e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(pairs: &[(&str, &str)]) -> MpdResponse {
        MpdResponse {
            pairs: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn workspace_line_marks_focus_and_urgency() {
        let workspaces: Vec<Workspace> = serde_json::from_str(
            r#"[{"name":"1","focused":true},{"name":"2","urgent":true},{"name":"3"}]"#,
        )
        .unwrap();
        assert_eq!(workspace_line(&workspaces), "workspaces: [1] 2! 3");
    }

    #[test]
    fn now_playing_prefers_artist_and_title() {
        let status = response(&[("state", "play")]);
        let song = response(&[("file", "a.flac"), ("Artist", "Low"), ("Title", "Words")]);
        assert_eq!(now_playing_line(&status, &song), "mpd: [play] Low - Words");
        assert_eq!(
            now_playing_line(&status, &response(&[("file", "a.flac")])),
            "mpd: [play] a.flac"
        );
        assert_eq!(
            now_playing_line(&response(&[("state", "stop")]), &song),
            "mpd: stopped"
        );
    }
}
