use playsync_client::api::HubApi;
use playsync_client::connection::{Backoff, ClientEvent, ConnectionHandle, ConnectionManager};
use playsync_client::controller::PlaybackController;
use playsync_client::dispatcher::CommandDispatcher;
use playsync_client::intent::PlaybackView;
use playsync_client::queue::QueueStore;
use playsync_client::transport::WsConnector;
use playsync_proto::config::Config;
use playsync_proto::protocol::{ItemRef, PlayMode, PlayRequest, PlayerState};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const LIST_LIMIT: usize = 50;

#[derive(Debug, PartialEq)]
enum Input {
    Pause,
    Seek(f64),
    Goto(f64),
    Volume(u8),
    Speed(f64),
    Next,
    Prev,
    Stop,
    List(Option<String>),
    Play(usize),
    Add(usize),
    PlayAll(usize),
    Cast { url: String, mode: PlayMode },
    Loop,
    Shuffle,
    Close,
    Status,
    Help,
    Quit,
}

fn parse_line(line: &str) -> Result<Input, String> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Err(String::new());
    };
    let rest: Vec<&str> = parts.collect();
    let number = |what: &str| -> Result<f64, String> {
        rest.first()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("usage: {} <number>", what))
    };

    let index = |usage: &str| -> Result<usize, String> {
        rest.first()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| format!("usage: {}", usage))
    };

    let input = match cmd {
        "pause" | "p" => Input::Pause,
        "seek" => Input::Seek(number("seek")?),
        "goto" => Input::Goto(number("goto")?.max(0.0)),
        "vol" => Input::Volume(number("vol")?.round().clamp(0.0, 100.0) as u8),
        "speed" => {
            let speed = number("speed")?;
            if speed <= 0.0 {
                return Err("speed must be positive".to_string());
            }
            Input::Speed(speed)
        }
        "next" | "n" => Input::Next,
        "prev" => Input::Prev,
        "stop" => Input::Stop,
        "ls" => Input::List((!rest.is_empty()).then(|| rest.join(" "))),
        "play" => Input::Play(index("play <n>")?),
        "add" => Input::Add(index("add <n>")?),
        "playall" => Input::PlayAll(if rest.is_empty() { 0 } else { index("playall [n]")? }),
        "cast" => {
            let (url, mode) = match rest.as_slice() {
                [url] => (url, PlayMode::Play),
                [url, "queue"] => (url, PlayMode::Queue),
                _ => return Err("usage: cast <url> [queue]".to_string()),
            };
            Input::Cast {
                url: url.to_string(),
                mode,
            }
        }
        "loop" => Input::Loop,
        "shuffle" => Input::Shuffle,
        "close" => Input::Close,
        "status" | "s" => Input::Status,
        "help" | "?" => Input::Help,
        "quit" | "q" | "exit" => Input::Quit,
        other => return Err(format!("unknown command `{}` (try `help`)", other)),
    };
    Ok(input)
}

fn format_time(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    let (h, m, s) = (total / 3600, (total / 60) % 60, total % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}

const HELP: &str = "\
commands:
  pause | seek <s> | goto <s> | vol <0-100> | speed <x> | stop
  next | prev          (queue if one is active, otherwise the player's playlist)
  ls [query]           list media
  play <n>             play from entry n of the last listing (local queue)
  add <n>              append entry n to the player's playlist
  playall [n]          hand the listing from n on to the player's playlist
  cast <url> [queue]   play or append a stream url
  loop | shuffle       toggle queue modes
  close                drop the queue
  status | quit";

struct Remote {
    connection: ConnectionHandle,
    dispatcher: CommandDispatcher,
    controller: PlaybackController<HubApi>,
    api: HubApi,
    view: PlaybackView,
    listing: Vec<ItemRef>,
    now_playing: Option<String>,
}

impl Remote {
    async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => println!("● connected"),
            ClientEvent::Disconnected { reason } => {
                println!("○ disconnected: {}", reason.as_deref().unwrap_or("closed"));
            }
            ClientEvent::RetryScheduled { attempt, delay } => {
                if attempt == 1 {
                    println!("  hub unavailable, retrying (next in {:.1}s)", delay.as_secs_f64());
                }
            }
            ClientEvent::State(state) => self.on_state(state).await,
            ClientEvent::ServerError(message) => println!("hub: {}", message),
            ClientEvent::CommandExecuted { action, .. } => println!("  (another client: {})", action),
        }
    }

    async fn on_state(&mut self, state: PlayerState) {
        self.view.apply(&state);
        if state.filename != self.now_playing {
            if let Some(name) = &state.filename {
                println!("▶ {}", name);
            }
            self.now_playing = state.filename.clone();
        }
        match self.controller.on_player_state(&state).await {
            Ok(Some(index)) => {
                if let Some(item) = self.controller.queue().and_then(|q| q.items.get(index)) {
                    println!("  queue → {}: {}", index, item.display_name());
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("auto-advance failed: {:#}", e);
                println!("auto-advance failed: {:#}", e);
            }
        }
    }

    async fn handle_input(&mut self, input: Input) -> anyhow::Result<()> {
        match input {
            Input::Pause => {
                self.view.predict_pause_toggle();
                self.dispatcher.play_pause();
            }
            Input::Seek(seconds) => {
                self.view.predict_relative_seek(seconds);
                self.dispatcher.seek(seconds);
            }
            Input::Goto(position) => {
                self.view.predict_seek(position);
                self.dispatcher.seek_absolute(position);
            }
            Input::Volume(level) => {
                self.view.predict_volume(level);
                self.dispatcher.volume(level);
            }
            Input::Speed(speed) => {
                self.view.predict_speed(speed);
                self.dispatcher.speed(speed);
            }
            Input::Next => {
                if self.controller.queue().is_some() {
                    self.controller.next().await?;
                } else {
                    self.dispatcher.next();
                }
            }
            Input::Prev => {
                if self.controller.queue().is_some() {
                    self.controller.prev().await?;
                } else {
                    self.dispatcher.prev();
                }
            }
            Input::Stop => self.dispatcher.stop(),
            Input::List(query) => {
                let page = self.api.list_media(query.as_deref(), 0, LIST_LIMIT).await?;
                for (i, item) in page.items.iter().enumerate() {
                    println!("{:>4}  {}", i, item.path);
                }
                if page.total > page.items.len() {
                    println!("  … {} more", page.total - page.items.len());
                }
                self.listing = page.items;
            }
            Input::Play(index) => {
                self.listed(index)?;
                self.controller
                    .play_from_here(self.listing.clone(), index)
                    .await?;
            }
            Input::Add(index) => {
                let item = self.listed(index)?.clone();
                let request = PlayRequest::new(vec![item], PlayMode::Queue);
                self.api.play_many(&request).await?;
                println!("added to the player's playlist");
            }
            Input::PlayAll(index) => {
                self.listed(index)?;
                let items = self.listing[index..].to_vec();
                let count = items.len();
                self.api
                    .play_many(&PlayRequest::new(items, PlayMode::Play))
                    .await?;
                // next/prev now steer the player's playlist.
                if self.controller.queue().is_some() {
                    self.controller.close().await?;
                }
                println!("player playlist: {} items", count);
            }
            Input::Cast { url, mode } => self.api.cast_url(&url, mode).await?,
            Input::Loop => {
                let on = self.controller.toggle_loop().await?;
                println!("loop one: {}", if on { "on" } else { "off" });
            }
            Input::Shuffle => {
                let on = self.controller.toggle_shuffle().await?;
                println!("shuffle: {}", if on { "on" } else { "off" });
            }
            Input::Close => {
                self.controller.close().await?;
                println!("queue closed");
            }
            Input::Status => self.print_status(),
            Input::Help => println!("{}", HELP),
            Input::Quit => {}
        }
        Ok(())
    }

    fn listed(&self, index: usize) -> anyhow::Result<&ItemRef> {
        self.listing
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("no entry {} in the last listing (run `ls` first)", index))
    }

    fn print_status(&self) {
        let session = self.connection.session();
        if session.connected {
            println!("hub: connected");
        } else {
            println!(
                "hub: disconnected ({}), retry #{}",
                session.last_error.as_deref().unwrap_or("no error"),
                session.reconnect_attempt
            );
        }

        let shown = self.view.display();
        match &shown.filename {
            Some(name) => println!(
                "{} {}  {} / {}  vol {}  x{:.2}{}",
                if shown.paused { "⏸" } else { "▶" },
                name,
                format_time(shown.time_pos),
                format_time(shown.duration),
                shown.volume,
                shown.speed,
                if self.view.has_pending() { "  (pending)" } else { "" },
            ),
            None => println!("player idle"),
        }

        if let Some(queue) = self.controller.queue() {
            println!(
                "queue: {}/{}{}{}",
                queue.current_index + 1,
                queue.len(),
                if queue.loop_one { "  [loop one]" } else { "" },
                if queue.shuffle { "  [shuffle]" } else { "" },
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = playsync_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("client.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,playsync_client=debug")
            }),
        )
        .init();

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let api = HubApi::from_config(&config.client)?;
    let connector = WsConnector::new(config.client.control_url());
    info!("Control channel: {}", connector.url());

    let manager = ConnectionManager::new(
        connector,
        api.clone(),
        Backoff::from_config(&config.client),
        config.client.probe_timeout(),
    );
    let (connection, mut events) = manager.spawn();

    let queue = QueueStore::from_config(&config.queue);
    if let Some(q) = queue.state() {
        println!("restored queue: {} items at {}", q.len(), q.current_index + 1);
    }
    let controller = PlaybackController::new(queue, api.clone(), &config.client);

    let mut remote = Remote {
        dispatcher: connection.dispatcher(),
        view: PlaybackView::new(connection.player_state()),
        connection,
        controller,
        api,
        listing: Vec::new(),
        now_playing: None,
    };

    println!("playsync → {} (type `help`)", config.client.server_url);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(Input::Quit) => break,
                    Ok(input) => {
                        if let Err(e) = remote.handle_input(input).await {
                            println!("error: {:#}", e);
                        }
                    }
                    Err(msg) if msg.is_empty() => {}
                    Err(msg) => println!("{}", msg),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin: {}", e);
                    break;
                }
            },
            Some(event) = events.recv() => remote.handle_event(event).await,
        }
    }

    remote.connection.disconnect().await;
    Ok(())
}
