use std::io::Cursor;

use chatrelay_client::{
    config::{ClientArgs, ClientConfig},
    connection::ConnectionManager,
    image_pipeline::ImagePipeline,
    media::{MediaKind, PathMediaSource},
    message_log::Side,
    session::{SendOutcome, SessionController, SessionError},
};
use chatrelay_core::{ImagePayload, Message};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};

enum Command {
    Send(String),
    Image(String),
    Camera,
    ClearImage,
    Quit,
}

fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed == "/quit" {
        Command::Quit
    } else if trimmed == "/camera" {
        Command::Camera
    } else if trimmed == "/clear" {
        Command::ClearImage
    } else if let Some(path) = trimmed.strip_prefix("/image ") {
        Command::Image(path.trim().to_owned())
    } else {
        Command::Send(line.to_owned())
    }
}

fn describe(message: &Message) -> String {
    match message.image() {
        ImagePayload::None => message.text().to_owned(),
        ImagePayload::Encoded(image) => {
            let dimensions = image::ImageReader::new(Cursor::new(image.data()))
                .with_guessed_format()
                .ok()
                .and_then(|reader| reader.into_dimensions().ok());
            let marker = match dimensions {
                Some((width, height)) => format!("[image {width}x{height} {} bytes]", image.len()),
                None => format!("[image {} bytes]", image.len()),
            };
            if message.text().is_empty() {
                marker
            } else {
                format!("{} {marker}", message.text())
            }
        }
    }
}

fn print_new_entries(session: &mut SessionController<PathMediaSource>, printed: &mut usize) {
    if let Some(log) = session.log() {
        for (side, message) in log.view(session.identity()).skip(*printed) {
            let prefix = match side {
                Side::Sent => '>',
                Side::Received => '<',
            };
            println!("{prefix} {}", describe(message));
            *printed += 1;
        }
    }
    for notice in session.take_notices() {
        println!("! {notice}");
    }
}

async fn run_command(session: &mut SessionController<PathMediaSource>, command: Command) {
    let result = match command {
        Command::Send(text) => {
            session.set_compose_text(text);
            session.send_composed().map(|outcome| {
                if let SendOutcome::Rejected = outcome {
                    debug!("blank input ignored");
                }
            })
        }
        Command::Image(path) => {
            session.media_mut().queue_path(path);
            session.pick_image(MediaKind::Gallery).await
        }
        Command::Camera => session.pick_image(MediaKind::Camera).await,
        Command::ClearImage => {
            session.clear_staged_image();
            Ok(())
        }
        Command::Quit => Ok(()),
    };

    match result {
        Ok(()) => {}
        // Already surfaced as notices.
        Err(SessionError::PermissionDenied(_) | SessionError::PickCancelled) => {}
        Err(err) => println!("! {err}"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = ClientArgs::parse();
    let config = match ClientConfig::from_args(&args) {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    info!(endpoint = %config.endpoint, "chat client starting");
    let mut session = SessionController::new(
        ConnectionManager::new(config.transport),
        config.endpoint,
        PathMediaSource::new(),
        ImagePipeline::new(config.pipeline),
    );
    if let Err(err) = session.mount().await {
        error!("failed to open chat session: {err}");
        std::process::exit(1);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printed = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let command = match line {
                    Ok(Some(line)) => parse_command(&line),
                    Ok(None) => Command::Quit,
                    Err(err) => {
                        error!("failed to read stdin: {err}");
                        Command::Quit
                    }
                };
                if let Command::Quit = command {
                    break;
                }
                run_command(&mut session, command).await;
            }
            update = session.next_event() => {
                let Some(update) = update else {
                    break;
                };
                debug!(?update, "session update");
            }
        }
        print_new_entries(&mut session, &mut printed);
    }

    if let Some(log) = session.unmount() {
        info!(messages = log.len(), "chat session closed");
    }
}
