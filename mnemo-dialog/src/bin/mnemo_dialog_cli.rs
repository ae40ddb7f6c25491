use clap::Parser;
use mnemo_dialog::{ChatMessage, DialogSegmenter, SegmenterConfig};
use std::fs;
use std::io::{self, BufRead, Read};

/// A CLI tool to segment chat messages (JSON Lines) into dialog windows.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input file (one ChatMessage JSON object per line). If not
    /// provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Gap in seconds that starts a new dialog.
    #[arg(long, default_value_t = 1800)]
    gap_secs: i64,

    /// Minimum window size in messages.
    #[arg(long, default_value_t = 3)]
    min_window: usize,

    /// Maximum window size in messages.
    #[arg(long, default_value_t = 12)]
    max_window: usize,

    /// Step between overlapping windows over long dialogs.
    #[arg(long, default_value_t = 6)]
    step: usize,

    /// Print one-line summaries instead of JSON.
    #[arg(long)]
    summary: bool,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let raw = if let Some(input_path) = &args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let mut messages: Vec<ChatMessage> = Vec::new();
    for (line_no, line) in raw.as_bytes().lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ChatMessage = serde_json::from_str(&line).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: {e}", line_no + 1),
            )
        })?;
        messages.push(message);
    }
    messages.sort_by_key(|m| (m.conversation_id, m.sent_at, m.message_id));

    let config = SegmenterConfig::default()
        .with_dialog_gap_secs(args.gap_secs)
        .with_window_bounds(args.min_window, args.max_window)
        .with_window_step(args.step);
    let segmenter = DialogSegmenter::new(config);

    // Segment each conversation independently.
    let mut windows = Vec::new();
    let mut start = 0;
    while start < messages.len() {
        let conversation = messages[start].conversation_id;
        let end = messages[start..]
            .iter()
            .position(|m| m.conversation_id != conversation)
            .map(|offset| start + offset)
            .unwrap_or(messages.len());
        windows.extend(segmenter.windows(&messages[start..end]));
        start = end;
    }

    if args.summary {
        for w in &windows {
            println!(
                "conversation {} center {} span {}..{} ({} messages)",
                w.conversation_id, w.center_message_id, w.start_message_id, w.end_message_id, w.size
            );
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&windows)?);
    }

    Ok(())
}
