use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use devgate_frame::command::describe_payload;
use devgate_frame::Frame;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FieldOutput {
    name: &'static str,
    value: String,
}

#[derive(Serialize)]
struct FrameOutput {
    device_id: String,
    command: String,
    command_name: &'static str,
    length: usize,
    wire_size: usize,
    checksum: String,
    fields: Vec<FieldOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
    hex: String,
    timestamp: String,
}

impl FrameOutput {
    fn new(frame: &Frame, peer: Option<SocketAddr>) -> Self {
        Self {
            device_id: frame.device_id().to_string(),
            command: format!("0x{:02X}", frame.command_type()),
            command_name: command_name(frame),
            length: frame.wire_size() - devgate_frame::MAGIC.len(),
            wire_size: frame.wire_size(),
            checksum: format!("0x{:02X}", frame.checksum()),
            fields: describe_payload(frame)
                .into_iter()
                .map(|(name, value)| FieldOutput { name, value })
                .collect(),
            peer: peer.map(|addr| addr.to_string()),
            hex: to_hex(frame.as_ref()),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_frame(frame: &Frame, peer: Option<SocketAddr>, format: OutputFormat) {
    let out = FrameOutput::new(frame, peer);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            table.add_row(vec!["device".to_string(), out.device_id.clone()]);
            table.add_row(vec![
                "command".to_string(),
                format!("{} ({})", out.command, out.command_name),
            ]);
            table.add_row(vec!["length".to_string(), out.length.to_string()]);
            table.add_row(vec!["checksum".to_string(), out.checksum.clone()]);
            for field in &out.fields {
                table.add_row(vec![field.name.to_string(), field.value.clone()]);
            }
            if let Some(peer) = &out.peer {
                table.add_row(vec!["peer".to_string(), peer.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let fields: Vec<String> = out
                .fields
                .iter()
                .map(|field| format!("{}={}", field.name, field.value))
                .collect();
            println!(
                "device={} command={} ({}) length={} {}",
                out.device_id,
                out.command,
                out.command_name,
                out.length,
                fields.join(" ")
            );
        }
        OutputFormat::Raw => print_raw(frame.as_ref()),
    }
}

/// Print an encoded frame produced by `build`.
pub fn print_encoded(frame: &Frame, format: OutputFormat) {
    match format {
        OutputFormat::Pretty => println!("{}", to_hex(frame.as_ref())),
        OutputFormat::Raw => print_raw(frame.as_ref()),
        other => print_frame(frame, None, other),
    }
}

/// One line per gateway event; JSON lines when `format` is json.
pub fn print_event(event: &str, fields: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let mut map = serde_json::Map::new();
            map.insert("event".to_string(), event.into());
            for (key, value) in fields {
                map.insert((*key).to_string(), value.clone().into());
            }
            map.insert("timestamp".to_string(), now_unix_seconds().into());
            print_json(&map);
        }
        _ => {
            let rendered: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            println!("{event} {}", rendered.join(" "));
        }
    }
    let _ = std::io::stdout().flush();
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn command_name(frame: &Frame) -> &'static str {
    frame.command().map_or("unknown", |command| command.name())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
