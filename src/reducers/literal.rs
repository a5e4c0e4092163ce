//! Bracketed list literals such as `['Jane Austen', "O'Brien"]` or `[5, 3]`.
//!
//! Grammar, with optional whitespace around every token:
//!
//! ```text
//! list  := "[" "]" | "[" item ("," item)* "]"
//! item  := "'" [^']* "'" | '"' [^"]* '"' | bare
//! bare  := one or more chars other than , [ ] ' " and whitespace
//! ```
//!
//! There are no escapes and no nesting. Parsed items are returned without
//! their quotes.

use thiserror::Error;

/// Errors raised by [`parse_list`] and [`render_list`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum LiteralError {
  /// The text does not start with `[` or does not end with `]`.
  #[error("list literal must be enclosed in brackets: {0:?}")]
  NotAList(String),
  /// A quoted item is missing its closing quote.
  #[error("unterminated quoted item at byte {0}")]
  UnterminatedQuote(usize),
  /// An item is empty, e.g. `[1,,2]` or `[1,]`.
  #[error("empty item at byte {0}")]
  EmptyItem(usize),
  /// A character that is not allowed at this position.
  #[error("unexpected {found:?} at byte {position}")]
  Unexpected {
    /// Offending character.
    found: char,
    /// Byte offset inside the list body.
    position: usize,
  },
  /// An item contains both quote characters and cannot be rendered.
  #[error("item {0:?} contains both quote characters")]
  Unrepresentable(String),
}

/// Parses a list literal into its items.
///
/// # Errors
///
/// Any input outside the grammar above.
pub fn parse_list(text: &str) -> Result<Vec<String>, LiteralError> {
  let trimmed = text.trim();
  let body = trimmed
    .strip_prefix('[')
    .and_then(|rest| rest.strip_suffix(']'))
    .ok_or_else(|| LiteralError::NotAList(text.to_string()))?;

  let mut items = Vec::new();
  if body.trim().is_empty() {
    return Ok(items);
  }

  let chars: Vec<(usize, char)> = body.char_indices().collect();
  let mut i = 0;
  loop {
    while i < chars.len() && chars[i].1.is_whitespace() {
      i += 1;
    }
    let Some(&(start, first)) = chars.get(i) else {
      return Err(LiteralError::EmptyItem(body.len()));
    };

    match first {
      '\'' | '"' => {
        let close = chars[i + 1..]
          .iter()
          .position(|&(_, c)| c == first)
          .ok_or(LiteralError::UnterminatedQuote(start))?;
        let end = i + 1 + close;
        items.push(body[start + 1..chars[end].0].to_string());
        i = end + 1;
      }
      ',' => return Err(LiteralError::EmptyItem(start)),
      '[' | ']' => {
        return Err(LiteralError::Unexpected {
          found: first,
          position: start,
        });
      }
      _ => {
        let mut end = i;
        while end < chars.len() && !is_separator(chars[end].1) {
          end += 1;
        }
        if let Some(&(position, found)) = chars.get(end) {
          if matches!(found, '\'' | '"' | '[' | ']') {
            return Err(LiteralError::Unexpected { found, position });
          }
        }
        let stop = chars.get(end).map_or(body.len(), |&(pos, _)| pos);
        items.push(body[start..stop].to_string());
        i = end;
      }
    }

    while i < chars.len() && chars[i].1.is_whitespace() {
      i += 1;
    }
    match chars.get(i) {
      None => return Ok(items),
      Some(&(_, ',')) => i += 1,
      Some(&(position, found)) => return Err(LiteralError::Unexpected { found, position }),
    }
  }
}

fn is_separator(c: char) -> bool {
  c == ',' || c.is_whitespace() || matches!(c, '\'' | '"' | '[' | ']')
}

/// Renders items as a list literal that [`parse_list`] reads back.
///
/// Items are single-quoted, or double-quoted when they contain a single
/// quote.
///
/// # Errors
///
/// [`LiteralError::Unrepresentable`] for an item holding both quote
/// characters.
pub fn render_list<I, S>(items: I) -> Result<String, LiteralError>
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let mut rendered = Vec::new();
  for item in items {
    let item = item.as_ref();
    let quote = match (item.contains('\''), item.contains('"')) {
      (false, _) => '\'',
      (true, false) => '"',
      (true, true) => return Err(LiteralError::Unrepresentable(item.to_string())),
    };
    rendered.push(format!("{quote}{item}{quote}"));
  }
  Ok(format!("[{}]", rendered.join(", ")))
}
