//! Interactive line client for Meteor. Each input line is sent as one
//! command; the newline-terminated response is printed back.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::ExitCode;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Parser, Debug)]
#[command(name = "meteor-cli", about = "Meteor interactive client")]
struct Cli {
    /// Server address.
    #[arg(long, default_value = "127.0.0.1:7653")]
    addr: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut stream = match TcpStream::connect(&cli.addr) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("failed to connect to {}: {e}", cli.addr);
            return ExitCode::FAILURE;
        }
    };
    println!("connected to {}", cli.addr);

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("failed to initialise line editor: {e}");
            return ExitCode::FAILURE;
        }
    };

    loop {
        match editor.readline("meteor> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
                    break;
                }
                let _ = editor.add_history_entry(line);

                if let Err(e) = roundtrip(&mut stream, line) {
                    eprintln!("connection error: {e}");
                    return ExitCode::FAILURE;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("input error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

/// Send one command and print the server's newline-terminated reply.
fn roundtrip(stream: &mut TcpStream, line: &str) -> std::io::Result<()> {
    stream.write_all(line.as_bytes())?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            ));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.ends_with(b"\n") {
            break;
        }
    }

    print!("{}", String::from_utf8_lossy(&response));
    Ok(())
}
