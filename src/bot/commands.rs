/// Chat commands and lookup logic

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
  Start,
  AddExpense,
  NewCategory,
  ListCategories,
  ReportWeek,
  ReportMonth,
  ReportYear,
  CurrencyAll,
  CurrencyGet,
  CurrencySet,
  LimitGet,
  LimitSet,
}

#[derive(Debug, Clone)]
pub struct Command {
  pub kind: CommandKind,
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub usage: &'static str,
  pub description: &'static str,
}

/// All available commands, in help order
pub const COMMANDS: &[Command] = &[
  Command {
    kind: CommandKind::Start,
    name: "start",
    aliases: &["help"],
    usage: "",
    description: "show this help",
  },
  Command {
    kind: CommandKind::AddExpense,
    name: "addexp",
    aliases: &["add", "expense"],
    usage: " <category name> <amount> \\[dd/mm/yy]",
    description: "add new expense",
  },
  Command {
    kind: CommandKind::NewCategory,
    name: "newcat",
    aliases: &["category"],
    usage: " <category name>",
    description: "create a new expense category",
  },
  Command {
    kind: CommandKind::ListCategories,
    name: "listcat",
    aliases: &["categories"],
    usage: "",
    description: "get a list of your expense categories",
  },
  Command {
    kind: CommandKind::ReportWeek,
    name: "repw",
    aliases: &["week"],
    usage: "",
    description: "get a weekly report by category",
  },
  Command {
    kind: CommandKind::ReportMonth,
    name: "repm",
    aliases: &["month"],
    usage: "",
    description: "get a monthly report by category",
  },
  Command {
    kind: CommandKind::ReportYear,
    name: "repa",
    aliases: &["year"],
    usage: "",
    description: "get the annual report by category",
  },
  Command {
    kind: CommandKind::CurrencyAll,
    name: "curall",
    aliases: &["currencies"],
    usage: "",
    description: "get currency list",
  },
  Command {
    kind: CommandKind::CurrencyGet,
    name: "curget",
    aliases: &["currency"],
    usage: "",
    description: "get active currency",
  },
  Command {
    kind: CommandKind::CurrencySet,
    name: "curset",
    aliases: &[],
    usage: " <CUR>",
    description: "set active currency",
  },
  Command {
    kind: CommandKind::LimitGet,
    name: "limitget",
    aliases: &["limit"],
    usage: "",
    description: "get month expense limit",
  },
  Command {
    kind: CommandKind::LimitSet,
    name: "limitset",
    aliases: &[],
    usage: " \\[amount]",
    description: "set month expense limit, no amount removes the limit",
  },
];

/// Resolve the first word of a message (with or without the leading `/`)
/// by exact name or alias.
pub fn resolve(word: &str) -> Option<&'static Command> {
  let word = word.strip_prefix('/').unwrap_or(word).to_lowercase();
  // "/repw@spendbot" in group chats
  let word = word.split('@').next().unwrap_or_default();
  COMMANDS
    .iter()
    .find(|cmd| cmd.name == word || cmd.aliases.contains(&word))
}

/// Get suggestions for a given input
pub fn get_suggestions(input: &str) -> Vec<&'static Command> {
  let input_lower = input.strip_prefix('/').unwrap_or(input).to_lowercase();

  if input_lower.is_empty() {
    return COMMANDS.iter().collect();
  }

  let mut matches: Vec<(&Command, u32)> = Vec::new();

  for cmd in COMMANDS {
    if cmd.name == input_lower {
      matches.push((cmd, 0));
      continue;
    }

    if cmd.aliases.contains(&input_lower.as_str()) {
      matches.push((cmd, 1));
      continue;
    }

    if cmd.name.starts_with(&input_lower) {
      matches.push((cmd, 2));
      continue;
    }

    if cmd.aliases.iter().any(|a| a.starts_with(&input_lower)) {
      matches.push((cmd, 3));
      continue;
    }

    // Fuzzy match (contains)
    if cmd.name.contains(&input_lower) {
      matches.push((cmd, 4));
      continue;
    }

    if cmd.aliases.iter().any(|a| a.contains(&input_lower)) {
      matches.push((cmd, 5));
    }
  }

  matches.sort_by_key(|(_, priority)| *priority);

  matches.into_iter().map(|(cmd, _)| cmd).collect()
}

/// Markdown help listing every command.
pub fn help_text() -> String {
  let mut text = String::from("You can control me by sending these commands:\n");
  for cmd in COMMANDS {
    text.push_str(&format!("\n/{}{} - {}", cmd.name, cmd.usage, cmd.description));
  }
  text
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_input_returns_all() {
    let suggestions = get_suggestions("");
    assert_eq!(suggestions.len(), COMMANDS.len());
  }

  #[test]
  fn test_resolve_name_and_alias() {
    assert_eq!(resolve("/repw").unwrap().kind, CommandKind::ReportWeek);
    assert_eq!(resolve("/REPM").unwrap().kind, CommandKind::ReportMonth);
    assert_eq!(resolve("/year").unwrap().kind, CommandKind::ReportYear);
    assert_eq!(resolve("/curset@spendbot").unwrap().kind, CommandKind::CurrencySet);
    assert!(resolve("/rep").is_none());
    assert!(resolve("").is_none());
  }

  #[test]
  fn test_prefix_match() {
    let suggestions = get_suggestions("/lim");
    let names: Vec<_> = suggestions.iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["limitget", "limitset"]);
  }

  #[test]
  fn test_fuzzy_match() {
    let suggestions = get_suggestions("cat");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0].name, "newcat");
  }

  #[test]
  fn test_help_lists_every_command() {
    let help = help_text();
    for cmd in COMMANDS {
      assert!(help.contains(&format!("/{}", cmd.name)));
    }
  }
}
