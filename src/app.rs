use crate::commands::{self, ConsoleCommand, COMMANDS};
use crate::event::{Event, EventHandler};
use color_eyre::Result;
use offsync::http::SOURCE_HEADER;
use offsync::{Method, Network, Notification, OfflineLayer, Request, Response, SwitchableNetwork};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Longest body shown for a response
const BODY_PREVIEW: usize = 400;

/// Interactive console session over an `OfflineLayer`
pub struct App {
  /// The layer every request goes through
  layer: Arc<OfflineLayer>,

  /// Network the layer uses; toggled by `online`/`offline`
  network: Arc<SwitchableNetwork>,

  /// Event sender for async tasks
  event_tx: mpsc::UnboundedSender<Event>,

  /// Whether to quit
  should_quit: bool,
}

impl App {
  pub fn new(layer: OfflineLayer, network: Arc<SwitchableNetwork>) -> Self {
    debug!(origin = ?layer.config().origin, "Console session created");
    let (tx, _rx) = mpsc::unbounded_channel();
    Self {
      layer: Arc::new(layer),
      network,
      event_tx: tx,
      should_quit: false,
    }
  }

  pub async fn run(&mut self) -> Result<()> {
    let probe = Duration::from_millis(self.layer.config().network.probe_interval_ms);
    let mut events = EventHandler::new(probe);
    self.event_tx = events.sender();

    self.forward_notifications();

    match self.layer.start().await {
      Ok(report) => {
        println!("ready (replayed {}, {} pending)", report.synced, report.remaining);
      }
      Err(e) => {
        // The layer still serves requests; only the precache is missing.
        warn!(error = %e, "Startup failed");
        println!("startup failed: {}", e);
      }
    }
    prompt();

    while !self.should_quit {
      match events.next().await {
        Some(event) => self.handle_event(event).await,
        None => break,
      }
    }

    Ok(())
  }

  fn forward_notifications(&self) {
    let mut subscription = self.layer.subscribe();
    let tx = self.event_tx.clone();
    tokio::spawn(async move {
      while let Some(notification) = subscription.recv().await {
        if tx.send(Event::Notification(notification)).is_err() {
          break;
        }
      }
    });
  }

  async fn handle_event(&mut self, event: Event) {
    match event {
      Event::Input(line) => {
        if !line.trim().is_empty() {
          self.execute(&line).await;
        }
        if !self.should_quit {
          prompt();
        }
      }
      Event::InputClosed => self.should_quit = true,
      Event::Tick => self.probe(),
      Event::Notification(notification) => print_notification(&notification),
    }
  }

  async fn execute(&mut self, line: &str) {
    let command = match commands::parse_line(line) {
      Ok(command) => command,
      Err(msg) => {
        println!("{}", msg);
        return;
      }
    };

    match command {
      ConsoleCommand::Request {
        method,
        target,
        body,
      } => {
        let url = match self.layer.config().resolve(&target) {
          Ok(url) => url,
          Err(e) => {
            println!("{}", e);
            return;
          }
        };
        let mut request = Request::new(method, url);
        if let Some(body) = body {
          request = request
            .with_header("content-type", "application/json")
            .with_body(body);
        }

        // Requests run on their own task so the prompt stays responsive
        let layer = self.layer.clone();
        tokio::spawn(async move {
          let label = format!("{} {}", request.method, request.url);
          let response = layer.handle(request).await;
          print_response(&label, &response);
          prompt();
        });
      }
      ConsoleCommand::Control(message) => {
        let reply = self.layer.handle_control(message).await;
        println!("{}", reply);
      }
      ConsoleCommand::Queue => {
        let pending = self.layer.queue().snapshot().await;
        if pending.is_empty() {
          println!("queue is empty");
        }
        for op in pending {
          println!(
            "#{:<4} {:<6} {} ({})",
            op.sequence,
            op.method,
            op.url,
            op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
          );
        }
      }
      ConsoleCommand::Online => {
        self.network.set_forced_offline(false);
        match self.layer.set_online(true).await {
          Some(report) => println!(
            "online: synced {}, dropped {}, remaining {}",
            report.synced, report.dropped, report.remaining
          ),
          None => println!("online"),
        }
      }
      ConsoleCommand::Offline => {
        self.network.set_forced_offline(true);
        self.layer.set_online(false).await;
        println!("offline (simulated)");
      }
      ConsoleCommand::Help => {
        for cmd in COMMANDS {
          let aliases = if cmd.aliases.is_empty() {
            String::new()
          } else {
            format!(" [{}]", cmd.aliases.join(", "))
          };
          println!("  {:<20} {}{}", cmd.usage, cmd.description, aliases);
        }
      }
      ConsoleCommand::Quit => self.should_quit = true,
    }
  }

  /// Check reachability of the origin and report it to the layer.
  fn probe(&self) {
    let origin = match self.layer.config().origin_url() {
      Ok(Some(origin)) => origin,
      _ => return,
    };

    let layer = self.layer.clone();
    let network = self.network.clone();
    tokio::spawn(async move {
      let request = Request::new(Method::Head, origin);
      let reachable = network.fetch(&request).await.is_ok();
      debug!(reachable, "Connectivity probe");
      if let Some(report) = layer.set_online(reachable).await {
        println!(
          "\nback online: synced {}, dropped {}, remaining {}",
          report.synced, report.dropped, report.remaining
        );
        prompt();
      }
    });
  }
}

fn prompt() {
  print!("offsync> ");
  let _ = std::io::stdout().flush();
}

fn print_response(label: &str, response: &Response) {
  let source = response.header(SOURCE_HEADER).unwrap_or("-");
  println!("\n{} -> {} [{}]", label, response.status, source);

  let body = response.body_text();
  if body.len() > BODY_PREVIEW {
    let cut = (0..=BODY_PREVIEW)
      .rev()
      .find(|i| body.is_char_boundary(*i))
      .unwrap_or(0);
    println!("{}... ({} bytes)", &body[..cut], response.body.len());
  } else if !body.is_empty() {
    println!("{}", body);
  }
}

fn print_notification(notification: &Notification) {
  match serde_json::to_string(notification) {
    Ok(json) => println!("\n[event] {}", json),
    Err(e) => println!("\n[event] {:?} ({})", notification, e),
  }
  prompt();
}
