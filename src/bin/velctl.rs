use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use velbus_gateway::field::{FieldKind, FieldType};
use velbus_gateway::messages::builtin_registry;
use velbus_gateway::module::{ReplyBody, Verb};
use velbus_gateway::protocol::{parse_hex, Frame};
use velbus_gateway::registry::MessageRegistry;
use velbus_gateway::schema::Message;
use velbus_gateway::wire::{ClientMessage, ServerMessage};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8445";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("velctl")
        .version("0.1.0")
        .author("Home Automation Engineering Team")
        .about("Velbus codec toolbox and velgate client")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("velgate host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("velgate port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Show field layouts")
                .global(true),
        )
        .subcommand(SubCommand::with_name("schemas").about("List the built-in message schemas"))
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode a payload the way the gateway would")
                .arg(
                    Arg::with_name("command")
                        .help("Command byte, e.g. ed or 0xed")
                        .required(true)
                        .validator(|v| parse_byte(&v).map(|_| ()).ok_or_else(|| "Command must be a hex byte".into())),
                )
                .arg(
                    Arg::with_name("payload")
                        .help("Data bytes after the command, in hex")
                        .default_value(""),
                ),
        )
        .subcommand(
            SubCommand::with_name("encode")
                .about("Encode a message from its schema defaults")
                .arg(Arg::with_name("schema").help("Schema name").required(true))
                .arg(
                    Arg::with_name("fields")
                        .help("field=value overrides; values are JSON or plain text")
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("address")
                        .short("a")
                        .long("address")
                        .value_name("ADDRESS")
                        .help("Destination module address (hex)")
                        .takes_value(true)
                        .default_value("00")
                        .validator(|v| parse_byte(&v).map(|_| ()).ok_or_else(|| "Address must be a hex byte".into())),
                ),
        )
        .subcommand(
            SubCommand::with_name("request")
                .about("Send a request to a module through velgate")
                .arg(
                    Arg::with_name("address")
                        .help("Module address (hex)")
                        .required(true)
                        .validator(|v| parse_byte(&v).map(|_| ()).ok_or_else(|| "Address must be a hex byte".into())),
                )
                .arg(Arg::with_name("path").help("Path below the module, e.g. /type").default_value(""))
                .arg(
                    Arg::with_name("verb")
                        .short("X")
                        .long("verb")
                        .value_name("VERB")
                        .takes_value(true)
                        .possible_values(&["GET", "PUT", "POST", "DELETE"])
                        .default_value("GET"),
                )
                .arg(
                    Arg::with_name("body")
                        .short("d")
                        .long("body")
                        .value_name("JSON")
                        .help("Request body")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("Stream state patches and outbound frames"))
        .subcommand(SubCommand::with_name("stats").about("Show gateway counters"))
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse::<u16>()?;
    let json = matches.value_of("format") == Some("json");
    let verbose = matches.is_present("verbose");

    match matches.subcommand() {
        ("schemas", _) => {
            let registry = builtin_registry()?;
            print_schemas(&registry, json, verbose);
        }
        ("decode", Some(sub_matches)) => handle_decode(sub_matches, json)?,
        ("encode", Some(sub_matches)) => handle_encode(sub_matches, json)?,
        ("request", Some(sub_matches)) => handle_request(sub_matches, host, port, json).await?,
        ("monitor", _) => monitor(host, port, json).await?,
        ("stats", _) => {
            let response = exchange(host, port, &ClientMessage::Stats).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
        }
    }

    Ok(())
}

fn parse_byte(text: &str) -> Option<u8> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).ok()
}

fn describe(field_type: &FieldType) -> String {
    match field_type.kind() {
        FieldKind::UInt => format!("uint({})", field_type.width()),
        FieldKind::Enum(variants) => format!("enum({}, {} variants)", field_type.width(), variants.iter().count()),
        FieldKind::Bitmap => format!("bitmap({})", field_type.width()),
        FieldKind::Bool => "bool".to_string(),
        FieldKind::Temperature { scale } => format!("temperature({}, x{})", field_type.width(), scale),
    }
}

fn print_schemas(registry: &MessageRegistry, json: bool, verbose: bool) {
    if json {
        let listing: Vec<Value> = registry
            .schemas()
            .map(|schema| {
                serde_json::json!({
                    "name": schema.name(),
                    "command": schema.command(),
                    "data_len": schema.data_len(),
                    "priority": schema.priority(),
                    "fields": schema.fields().iter().map(|f| f.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", Value::Array(listing));
        return;
    }

    println!("{}", "Built-in message schemas".bright_blue().bold());
    for schema in registry.schemas() {
        println!(
            "  {} {:<24} {} {}",
            format!("0x{:02x}", schema.command()).bright_cyan(),
            schema.name().bright_white(),
            format!("len={}", schema.data_len()).dimmed(),
            format!("prio={}", schema.priority()).dimmed(),
        );
        if verbose {
            for field in schema.fields() {
                println!("      {:<40} {}", field.name, describe(&field.field_type).dimmed());
            }
        }
    }
}

fn print_message(message: &Message, json: bool) {
    if json {
        println!("{}", serde_json::json!({"name": message.name(), "fields": message.to_json()}));
        return;
    }
    println!("{} {}", "✅".green(), message.name().bright_green().bold());
    for (field, value) in message.fields() {
        println!("  {:<40} {}", field.name.bright_white(), value.to_string().bright_cyan());
    }
}

fn handle_decode(matches: &ArgMatches<'_>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let command = matches.value_of("command").and_then(parse_byte).ok_or("Command must be a hex byte")?;
    let payload = parse_hex(matches.value_of("payload").unwrap_or("")).ok_or("Payload must be hex bytes")?;
    let registry = builtin_registry()?;
    let frame = Frame::new(0, command, &payload)?;

    match registry.decode(&frame) {
        Ok(message) => print_message(&message, json),
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e.to_string().bright_red());
            let variants: Vec<_> = registry
                .variants(command)
                .map(|schema| format!("{} (len={})", schema.name(), schema.data_len()))
                .collect();
            if !variants.is_empty() {
                eprintln!("{} Known layouts for 0x{:02x}: {}", "💡".yellow(), command, variants.join(", "));
            }
            return Err(e.into());
        }
    }
    Ok(())
}

fn handle_encode(matches: &ArgMatches<'_>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = builtin_registry()?;
    let name = matches.value_of("schema").unwrap_or_default();
    let address = matches.value_of("address").and_then(parse_byte).unwrap_or(0);
    let Some(schema) = registry.schema(name) else {
        eprintln!("{} Unknown schema {}", "❌".red(), name.bright_white());
        eprintln!("{} Try: {}", "💡".yellow(), "velctl schemas".bright_cyan());
        return Err(format!("unknown schema `{}`", name).into());
    };

    let mut message = schema.default_message();
    for assignment in matches.values_of("fields").into_iter().flatten() {
        let (field, raw) = assignment
            .split_once('=')
            .ok_or_else(|| format!("expected field=value, got `{}`", assignment))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        message.set_json(field, &value)?;
    }

    let frame = registry.encode(address, &message)?;
    if json {
        println!("{}", serde_json::to_string(&frame)?);
    } else {
        print_message(&message, false);
        println!("{} {}", "📤".bright_blue(), frame.to_string().bright_white());
    }
    Ok(())
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", host, port);
    match TcpStream::connect(&addr).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            eprintln!("{} Failed to connect to velgate at {}", "❌".red(), addr.bright_white());
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                eprintln!("{} Gateway is not running. Start it with:", "💡".yellow());
                eprintln!("   {}", "velgate --listen 127.0.0.1:8445".bright_cyan());
            }
            Err(e.into())
        }
    }
}

/// Send one message and wait for the first line that answers it, skipping
/// the initial state sync.
async fn exchange(host: &str, port: u16, message: &ClientMessage) -> Result<ServerMessage, Box<dyn std::error::Error>> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    let answer = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<ServerMessage>(&line)? {
                ServerMessage::Patch(_) | ServerMessage::Outbound(_) => continue,
                answer => return Ok(Some(answer)),
            }
        }
        Ok::<_, Box<dyn std::error::Error>>(None)
    })
    .await;

    match answer {
        Ok(Ok(Some(answer))) => Ok(answer),
        Ok(Ok(None)) => Err("velgate closed the connection".into()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            eprintln!("{} Request timed out after 5 seconds", "⏰".yellow());
            Err("request timeout".into())
        }
    }
}

async fn handle_request(
    matches: &ArgMatches<'_>,
    host: &str,
    port: u16,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let address = matches.value_of("address").and_then(parse_byte).ok_or("Address must be a hex byte")?;
    let verb: Verb = matches.value_of("verb").unwrap_or("GET").parse()?;
    let body = match matches.value_of("body") {
        Some(text) => serde_json::from_str(text)?,
        None => Value::Null,
    };
    let request = ClientMessage::Request {
        address,
        path: matches.value_of("path").unwrap_or("").to_string(),
        verb,
        body,
    };

    let response = exchange(host, port, &request).await?;
    if json {
        println!("{}", serde_json::to_string(&response)?);
        return Ok(());
    }
    match response {
        ServerMessage::Reply { status, body, .. } => {
            let status_text = if (200..300).contains(&status) {
                status.to_string().green()
            } else {
                status.to_string().red()
            };
            println!("{} {}", "Status".bright_white(), status_text);
            match body {
                ReplyBody::Text(text) => print!("{}", text.replace("\r\n", "\n")),
                ReplyBody::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            }
        }
        ServerMessage::Error { message } => {
            println!("{} {}", "❌".red(), message.bright_red());
        }
        other => println!("{}", serde_json::to_string(&other)?),
    }
    Ok(())
}

async fn monitor(host: &str, port: u16, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "📡 Monitoring velgate (Press Ctrl+C to stop)...".bright_blue().bold());
    let stream = connect(host, port).await?;
    let mut lines = BufReader::new(stream).lines();

    while let Some(line) = lines.next_line().await? {
        if json {
            println!("{}", line);
            continue;
        }
        match serde_json::from_str::<ServerMessage>(&line) {
            Ok(ServerMessage::Patch(patch)) => {
                for op in patch.ops {
                    let text = serde_json::to_string(&op)?;
                    println!("{} {}", format!("0x{:02x}", patch.address).bright_cyan(), text);
                }
            }
            Ok(ServerMessage::Outbound(frame)) => {
                println!("{} {}", "📤".bright_blue(), frame.to_string().bright_white());
            }
            Ok(other) => println!("{}", serde_json::to_string(&other)?),
            Err(e) => eprintln!("{} Unreadable line: {}", "⚠️".yellow(), e),
        }
    }
    Ok(())
}
