//! Console commands, aliases and line parsing

use offsync::{ControlMessage, Method};

#[derive(Debug, Clone)]
pub struct Command {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands
pub const COMMANDS: &[Command] = &[
  Command {
    name: "get",
    aliases: &["g", "fetch"],
    usage: "get URL",
    description: "Read a resource through the cache",
  },
  Command {
    name: "post",
    aliases: &["create"],
    usage: "post URL [BODY]",
    description: "Send a POST (queued if offline)",
  },
  Command {
    name: "put",
    aliases: &["replace"],
    usage: "put URL [BODY]",
    description: "Send a PUT (queued if offline)",
  },
  Command {
    name: "patch",
    aliases: &["update"],
    usage: "patch URL [BODY]",
    description: "Send a PATCH (queued if offline)",
  },
  Command {
    name: "delete",
    aliases: &["del", "rm"],
    usage: "delete URL",
    description: "Send a DELETE (queued if offline)",
  },
  Command {
    name: "sync",
    aliases: &["s", "sync-now"],
    usage: "sync",
    description: "Replay the offline queue now",
  },
  Command {
    name: "status",
    aliases: &["st"],
    usage: "status",
    description: "Show connectivity and queue length",
  },
  Command {
    name: "stats",
    aliases: &["cache-stats"],
    usage: "stats",
    description: "Show entries and limit per cache tier",
  },
  Command {
    name: "clear",
    aliases: &["clear-cache"],
    usage: "clear",
    description: "Drop every cached entry",
  },
  Command {
    name: "enforce",
    aliases: &["limits", "evict"],
    usage: "enforce",
    description: "Run eviction across all tiers",
  },
  Command {
    name: "queue",
    aliases: &["pending", "ls"],
    usage: "queue",
    description: "List queued operations",
  },
  Command {
    name: "drop-queue",
    aliases: &["clear-queue"],
    usage: "drop-queue",
    description: "Discard every queued operation",
  },
  Command {
    name: "online",
    aliases: &["up"],
    usage: "online",
    description: "Stop simulating an outage and signal reconnect",
  },
  Command {
    name: "offline",
    aliases: &["down"],
    usage: "offline",
    description: "Simulate an outage",
  },
  Command {
    name: "help",
    aliases: &["h", "?"],
    usage: "help",
    description: "List commands",
  },
  Command {
    name: "quit",
    aliases: &["q", "exit"],
    usage: "quit",
    description: "Exit offsync",
  },
];

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
  Request {
    method: Method,
    target: String,
    body: Option<String>,
  },
  Control(ControlMessage),
  Queue,
  Online,
  Offline,
  Help,
  Quit,
}

/// How well `cmd` matches `input`; lower is better.
fn match_rank(cmd: &Command, input: &str) -> Option<u32> {
  if cmd.name == input {
    Some(0)
  } else if cmd.aliases.contains(&input) {
    Some(1)
  } else if cmd.name.starts_with(input) {
    Some(2)
  } else if cmd.aliases.iter().any(|a| a.starts_with(input)) {
    Some(3)
  } else if cmd.name.contains(input) {
    Some(4)
  } else if cmd.aliases.iter().any(|a| a.contains(input)) {
    Some(5)
  } else {
    None
  }
}

/// Get suggestions for a given input, best match first
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = COMMANDS
    .iter()
    .filter_map(|cmd| match_rank(cmd, &input_lower).map(|rank| (cmd, rank)))
    .collect();

  // Stable sort keeps table order among equal ranks
  matches.sort_by_key(|(_, rank)| *rank);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Parse one console line.
pub fn parse_line(line: &str) -> Result<ConsoleCommand, String> {
  let line = line.trim();
  let (word, rest) = match line.split_once(char::is_whitespace) {
    Some((word, rest)) => (word, rest.trim()),
    None => (line, ""),
  };

  if word.is_empty() {
    return Err("empty command".to_string());
  }

  let cmd = get_suggestions(word)
    .into_iter()
    .next()
    .ok_or_else(|| format!("unknown command: {} (try 'help')", word))?;

  let request = |method: Method| {
    let (target, body) = match rest.split_once(char::is_whitespace) {
      Some((target, body)) => (target, Some(body.trim().to_string())),
      None => (rest, None),
    };
    if target.is_empty() {
      return Err(format!("usage: {}", cmd.usage));
    }
    Ok(ConsoleCommand::Request {
      method,
      target: target.to_string(),
      body: body.filter(|b| !b.is_empty()),
    })
  };

  match cmd.name {
    "get" => request(Method::Get),
    "post" => request(Method::Post),
    "put" => request(Method::Put),
    "patch" => request(Method::Patch),
    "delete" => request(Method::Delete),
    "sync" => Ok(ConsoleCommand::Control(ControlMessage::SyncNow)),
    "status" => Ok(ConsoleCommand::Control(ControlMessage::GetStatus)),
    "stats" => Ok(ConsoleCommand::Control(ControlMessage::GetCacheStats)),
    "clear" => Ok(ConsoleCommand::Control(ControlMessage::ClearCache)),
    "enforce" => Ok(ConsoleCommand::Control(ControlMessage::EnforceLimits)),
    "drop-queue" => Ok(ConsoleCommand::Control(ControlMessage::ClearQueue)),
    "queue" => Ok(ConsoleCommand::Queue),
    "online" => Ok(ConsoleCommand::Online),
    "offline" => Ok(ConsoleCommand::Offline),
    "help" => Ok(ConsoleCommand::Help),
    "quit" => Ok(ConsoleCommand::Quit),
    other => Err(format!("unhandled command: {}", other)),
  }
}
