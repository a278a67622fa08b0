//! A small shell: pipelines, assignments, and a few builtins

use crate::{
    errors::ProcessError,
    local::{LocalProcess, STDERR, STDIN, STDOUT},
    pipeline::{self, Command},
    protocol::exit,
    stream::{pipe, ByteReader, DEFAULT_HIGH_WATER_MARK},
};
use bytes::BytesMut;

/// What the shell does after a line
enum Flow {
    Continue(i32),
    Exit(i32),
}

/// Copy a pipe into one of the shell's own descriptors
async fn forward(process: &LocalProcess, mut reader: ByteReader, fd: u32) {
    loop {
        match reader.read().await {
            Ok(Some(chunk)) => {
                if let Err(err) = process.write(fd, chunk).await {
                    log::debug!("sh lost descriptor {}, {}", fd, err);
                    reader.cancel(err.to_string());
                    return;
                }
            }
            _ => return,
        }
    }
}

async fn run_pipeline(process: &LocalProcess, commands: Vec<Command>, input: ByteReader) -> i32 {
    let (output, output_reader) = pipe(DEFAULT_HIGH_WATER_MARK);
    let (errors, errors_reader) = pipe(DEFAULT_HIGH_WATER_MARK);
    let cwd = process.cwd();
    let env = process.env();
    let (result, _, _) = tokio::join!(
        pipeline::run(process, commands, &cwd, &env, input, output, errors),
        forward(process, output_reader, STDOUT),
        forward(process, errors_reader, STDERR),
    );
    match result {
        Ok(status) => status,
        Err(err) => {
            super::complain(process, &err.to_string()).await;
            err.exit_code()
        }
    }
}

async fn cd(process: &LocalProcess, target: Option<&String>) -> i32 {
    let target = target
        .cloned()
        .or_else(|| process.getenv("HOME"))
        .unwrap_or_else(|| "/".to_string());
    match process.read_dir(&target).await {
        Ok(_) => {
            let resolved = process.resolve(&target);
            process.set_cwd(&resolved);
            exit::EXIT_OK
        }
        Err(err) => {
            super::complain(process, &format!("cd: {}: {}", target, err)).await;
            exit::EXIT_FAILURE
        }
    }
}

async fn execute(process: &LocalProcess, line: &str, input: ByteReader, last: i32) -> Flow {
    let commands = match pipeline::parse(line) {
        Ok(commands) => commands,
        Err(err) => {
            super::complain(process, &err.to_string()).await;
            return Flow::Continue(err.exit_code());
        }
    };
    if commands.is_empty() {
        return Flow::Continue(last);
    }
    if commands.len() == 1 {
        let command = &commands[0];
        if command.is_assignment() {
            for (key, value) in &command.env {
                process.setenv(key.as_str(), value.as_str());
            }
            return Flow::Continue(exit::EXIT_OK);
        }
        let args = &command.argv[1..];
        match command.argv[0].as_str() {
            "cd" => return Flow::Continue(cd(process, args.first()).await),
            "exit" => {
                let code = match args.first().map(|code| code.parse::<i32>()) {
                    None => last,
                    Some(Ok(code)) => code,
                    Some(Err(_)) => {
                        super::complain(process, "exit: numeric argument required").await;
                        2
                    }
                };
                return Flow::Exit(code);
            }
            "export" => {
                for arg in args {
                    if let Some(at) = arg.find('=') {
                        process.setenv(&arg[..at], &arg[at + 1..]);
                    }
                }
                return Flow::Continue(exit::EXIT_OK);
            }
            "unset" => {
                for name in args {
                    process.unsetenv(name);
                }
                return Flow::Continue(exit::EXIT_OK);
            }
            _ => {}
        }
    }
    Flow::Continue(run_pipeline(process, commands, input).await)
}

/// `sh -c LINE` runs one line with the shell's own stdin; plain `sh` reads
/// lines from stdin until it ends or `exit` runs
pub async fn sh(process: LocalProcess) -> Result<i32, ProcessError> {
    let argv = process.argv().to_vec();
    if argv.get(1).map(String::as_str) == Some("-c") {
        let line = argv
            .get(2)
            .ok_or_else(|| ProcessError::Program("-c requires an argument".to_string()))?;
        let input = process.stdin()?;
        return Ok(match execute(&process, line, input, exit::EXIT_OK).await {
            Flow::Continue(code) | Flow::Exit(code) => code,
        });
    }

    let mut status = exit::EXIT_OK;
    let mut pending = BytesMut::new();
    let mut eof = false;
    loop {
        let newline = pending.iter().position(|b| *b == b'\n');
        let line = match newline {
            Some(at) => {
                let line = pending.split_to(at + 1);
                String::from_utf8_lossy(&line[..at]).into_owned()
            }
            None if eof => {
                if pending.is_empty() {
                    return Ok(status);
                }
                let line = pending.split();
                String::from_utf8_lossy(&line).into_owned()
            }
            None => {
                match process.read(STDIN).await? {
                    Some(chunk) => pending.extend_from_slice(&chunk),
                    None => eof = true,
                }
                continue;
            }
        };
        log::trace!("sh: {:?}", line);
        match execute(&process, &line, ByteReader::empty(), status).await {
            Flow::Continue(code) => status = code,
            Flow::Exit(code) => return Ok(code),
        }
    }
}
