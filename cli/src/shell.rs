//! Interactive session: commands run in the foreground while monitors keep
//! sampling in the background.

use std::io::Write;

use aif_common::bootstrap::AppContext;
use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};

use crate::cli::ShellLine;
use crate::commands::{execute, Session};

const PROMPT: &str = "aif> ";

/// Split a command line into words. Single and double quotes group words;
/// a backslash escapes the next character outside single quotes.
pub(crate) fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (_, '\\') => match chars.next() {
                Some(escaped) => {
                    current.push(escaped);
                    in_word = true;
                }
                None => return Err("trailing backslash".to_string()),
            },
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn prompt() {
    print!("{}", PROMPT);
    let _ = std::io::stdout().flush();
}

pub(crate) async fn run(ctx: &AppContext) -> Result<()> {
    println!("aif interactive shell. Type 'help' for commands, 'exit' to leave.");
    let mut session = Session::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt();
    while let Some(line) = lines.next_line().await? {
        let words = match split_words(&line) {
            Ok(words) => words,
            Err(e) => {
                println!("Cannot parse line: {}", e);
                prompt();
                continue;
            }
        };

        match words.first().map(String::as_str) {
            None => {}
            Some("exit") | Some("quit") => break,
            Some("help") => {
                if let Err(e) = ShellLine::try_parse_from(["--help"]) {
                    let _ = e.print();
                }
            }
            Some(_) => match ShellLine::try_parse_from(&words) {
                Ok(parsed) => {
                    if let Err(e) = execute(ctx, parsed.command, &mut session).await {
                        error!(error = %e, "Command failed");
                        println!("Error: {:#}", e);
                    }
                }
                Err(e) => {
                    let _ = e.print();
                }
            },
        }
        prompt();
    }

    let running = session.running();
    if running > 0 {
        println!(
            "Waiting for {} running monitor(s) to finish; press Ctrl-C to abandon them",
            running
        );
        tokio::select! {
            _ = session.wait_all() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!(monitors = running, "Abandoned running monitors");
            }
        }
    } else {
        session.wait_all().await;
    }
    Ok(())
}
