//! Operator console: line commands on stdin
//!
//! Lets the operator at the cart drive AutoAV by hand (start, stop,
//! cancel a scheduled stop, override the event name) and control vMix
//! streaming without a UI.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::autoav::AutoAvCommand;
use crate::fms::{MatchState, MatchStatus, TournamentLevel};
use crate::vmix::StreamInfo;

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Recorder(AutoAvCommand),
    StartStreaming(Option<u8>),
    StopStreaming(Option<u8>),
    SetStream(StreamInfo),
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
    start [match]                 Start recording (qualification match number)
    stop                          Stop recording now
    cancel                        Cancel a scheduled stop
    event [name]                  Override the event name; no name clears it
    stream start|stop [slot]      Start or stop vMix streaming
    stream set <slot> <url> <key> Configure an RTMP destination
    status                        Show whether AutoAV is running
    help                          Show this message
    quit                          Shut down";

/// Parse one console line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_lowercase().as_str() {
        "start" => {
            let status = match words.next() {
                Some(n) => {
                    let number: u32 = n.parse().with_context(|| format!("Invalid match number: {n}"))?;
                    Some(MatchStatus::new(
                        MatchState::GameSpecificData,
                        TournamentLevel::Qualification,
                        number,
                        1,
                    ))
                }
                None => None,
            };
            ConsoleCommand::Recorder(AutoAvCommand::StartRecording(status))
        }
        "stop" => ConsoleCommand::Recorder(AutoAvCommand::StopRecording),
        "cancel" => ConsoleCommand::Recorder(AutoAvCommand::CancelPendingStop),
        "event" => {
            let name = words.collect::<Vec<_>>().join(" ");
            let name = (!name.is_empty()).then_some(name);
            ConsoleCommand::Recorder(AutoAvCommand::SetEventName(name))
        }
        "stream" => parse_stream(words)?,
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => bail!("Unknown command: {other} (try 'help')"),
    };
    Ok(Some(command))
}

fn parse_stream<'a>(mut words: impl Iterator<Item = &'a str>) -> Result<ConsoleCommand> {
    let action = words.next().context("Usage: stream start|stop|set ...")?;
    match action {
        "start" => Ok(ConsoleCommand::StartStreaming(parse_slot(words.next())?)),
        "stop" => Ok(ConsoleCommand::StopStreaming(parse_slot(words.next())?)),
        "set" => {
            let (Some(index), Some(url), Some(key)) = (words.next(), words.next(), words.next())
            else {
                bail!("Usage: stream set <slot> <url> <key>");
            };
            Ok(ConsoleCommand::SetStream(StreamInfo {
                index: index.parse().with_context(|| format!("Invalid stream slot: {index}"))?,
                rtmp_url: url.to_string(),
                rtmp_key: key.to_string(),
            }))
        }
        other => bail!("Unknown stream action: {other}"),
    }
}

fn parse_slot(word: Option<&str>) -> Result<Option<u8>> {
    word.map(|w| w.parse().with_context(|| format!("Invalid stream slot: {w}")))
        .transpose()
}

/// Read stdin until EOF, forwarding parsed commands
pub async fn read_commands(tx: mpsc::Sender<ConsoleCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_command(&line) {
                Ok(Some(command)) => {
                    if tx.send(command).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => eprintln!("{e:#}"),
            },
            Ok(None) => {
                debug!("Console input closed");
                break;
            }
            Err(e) => {
                warn!("Failed to read console input: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(line: &str) -> ConsoleCommand {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn test_recorder_commands() {
        assert_eq!(
            parsed("start"),
            ConsoleCommand::Recorder(AutoAvCommand::StartRecording(None))
        );
        match parsed("START 14") {
            ConsoleCommand::Recorder(AutoAvCommand::StartRecording(Some(status))) => {
                assert_eq!(status.match_number, Some(14));
                assert_eq!(status.level, Some(TournamentLevel::Qualification));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(parsed(" stop "), ConsoleCommand::Recorder(AutoAvCommand::StopRecording));
        assert_eq!(
            parsed("cancel"),
            ConsoleCommand::Recorder(AutoAvCommand::CancelPendingStop)
        );
        assert_eq!(
            parsed("event Week 0  Scrimmage"),
            ConsoleCommand::Recorder(AutoAvCommand::SetEventName(Some(
                "Week 0 Scrimmage".to_string()
            )))
        );
        assert_eq!(
            parsed("event"),
            ConsoleCommand::Recorder(AutoAvCommand::SetEventName(None))
        );
    }

    #[test]
    fn test_stream_commands() {
        assert_eq!(parsed("stream start"), ConsoleCommand::StartStreaming(None));
        assert_eq!(parsed("stream stop 2"), ConsoleCommand::StopStreaming(Some(2)));
        assert_eq!(
            parsed("stream set 1 rtmp://live.example/app abc123"),
            ConsoleCommand::SetStream(StreamInfo {
                index: 1,
                rtmp_url: "rtmp://live.example/app".to_string(),
                rtmp_key: "abc123".to_string(),
            })
        );
        assert!(parse_command("stream set 1 rtmp://live.example/app").is_err());
        assert!(parse_command("stream start x").is_err());
    }

    #[test]
    fn test_misc_and_errors() {
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(parsed("status"), ConsoleCommand::Status);
        assert_eq!(parsed("?"), ConsoleCommand::Help);
        assert_eq!(parsed("exit"), ConsoleCommand::Quit);
        assert!(parse_command("start twelve").is_err());
        assert!(parse_command("record").is_err());
    }
}
