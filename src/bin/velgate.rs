use clap::{App, Arg};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{error, info, warn};
use velbus_gateway::config::{GatewayConfig, LogFormat};
use velbus_gateway::gateway::{Gateway, GatewayRequest};
use velbus_gateway::messages::builtin_registry;
use velbus_gateway::wire::{ClientMessage, ServerMessage};
use velbus_gateway::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("velgate")
        .version("0.1.0")
        .author("Home Automation Engineering Team")
        .about("Velbus gateway daemon - decodes bus frames and runs one runtime per module")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file (default: $VELGATE_CONFIG)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Address to accept bus clients on")
                .takes_value(true)
                .validator(|v| match v.parse::<std::net::SocketAddr>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Listen address must look like 127.0.0.1:8445".into()),
                }),
        )
        .arg(
            Arg::with_name("log-filter")
                .long("log-filter")
                .value_name("DIRECTIVE")
                .help("Log filter, e.g. `info` or `velbus_gateway=debug`")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .takes_value(true)
                .possible_values(&["pretty", "json"]),
        )
        .get_matches();

    let mut config = GatewayConfig::load(matches.value_of("config").map(Path::new))?;
    if let Some(listen) = matches.value_of("listen") {
        config.listen_addr = listen.parse()?;
    }
    if let Some(filter) = matches.value_of("log-filter") {
        config.logging.filter = filter.to_string();
    }
    match matches.value_of("log-format") {
        Some("json") => config.logging.format = LogFormat::Json,
        Some("pretty") => config.logging.format = LogFormat::Pretty,
        _ => {}
    }

    logging::init(&config.logging)?;

    // A broken catalog is fatal before anything is accepted
    let registry = Arc::new(builtin_registry()?);
    info!(schemas = registry.len(), "message catalog loaded");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue);
    let (request_tx, request_rx) = mpsc::channel(config.request_queue);
    let (events_tx, _) = broadcast::channel::<ServerMessage>(config.patch_buffer);

    let gateway = Gateway::new(Arc::clone(&registry), outbound_tx, config.patch_buffer);
    let gateway_task = tokio::spawn(gateway.run(frame_rx, request_rx, shutdown_signal()));

    // Outbound frames go to every connected client; the transport among them
    // puts them on the bus.
    let outbound_events = events_tx.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            info!(%frame, "outbound frame");
            let _ = outbound_events.send(ServerMessage::Outbound(frame));
        }
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening for bus clients");
    let server = tokio::spawn(accept_clients(listener, frame_tx, request_tx, events_tx));

    let stats = gateway_task.await?;
    server.abort();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn accept_clients(
    listener: TcpListener,
    frames: mpsc::Sender<velbus_gateway::Frame>,
    requests: mpsc::Sender<GatewayRequest>,
    events: broadcast::Sender<ServerMessage>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "client connected");
                let frames = frames.clone();
                let requests = requests.clone();
                let events = events.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, frames, requests, events).await {
                        warn!(%addr, error = %e, "client error");
                    }
                    info!(%addr, "client disconnected");
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn write_line(
    writer: &Mutex<OwnedWriteHalf>,
    message: &ServerMessage,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    writer.lock().await.write_all(line.as_bytes()).await?;
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    frames: mpsc::Sender<velbus_gateway::Frame>,
    requests: mpsc::Sender<GatewayRequest>,
    mut events: broadcast::Receiver<ServerMessage>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let writer = Arc::new(Mutex::new(writer));

    // Snapshot and live patches come from the same loop turn
    let (reply_tx, reply_rx) = oneshot::channel();
    requests
        .send(GatewayRequest::Subscribe { reply: reply_tx })
        .await?;
    let subscription = reply_rx.await?;
    for patch in subscription.snapshot {
        write_line(&writer, &ServerMessage::Patch(patch)).await?;
    }

    let push_writer = Arc::clone(&writer);
    let mut patches = subscription.patches;
    let push_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                patch = patches.recv() => match patch {
                    Ok(patch) => ServerMessage::Patch(patch),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The client's state is unusable now; it reconnects for a fresh sync
                        warn!(missed, "client lagging behind state patches, closing");
                        let _ = push_writer.lock().await.shutdown().await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "client missed outbound frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if let Err(e) = write_line(&push_writer, &message).await {
                warn!(error = %e, "failed to push to client");
                break;
            }
        }
    });

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ClientMessage>(trimmed) {
            Ok(ClientMessage::Frame(frame)) => {
                frames.send(frame).await?;
                None
            }
            Ok(ClientMessage::Request {
                address,
                path,
                verb,
                body,
            }) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                requests
                    .send(GatewayRequest::Dispatch {
                        address,
                        path,
                        verb,
                        body,
                        reply: reply_tx,
                    })
                    .await?;
                Some(ServerMessage::reply(address, reply_rx.await?))
            }
            Ok(ClientMessage::Stats) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                requests.send(GatewayRequest::Stats { reply: reply_tx }).await?;
                Some(ServerMessage::Stats(reply_rx.await?))
            }
            Err(e) => {
                warn!(error = %e, "unparseable client line");
                Some(ServerMessage::error(format!("Invalid message: {}", e)))
            }
        };

        if let Some(response) = response {
            write_line(&writer, &response).await?;
        }
    }

    push_task.abort();
    Ok(())
}
