//! Command lines: parsing, and running them as chains of processes

use crate::{
    errors::RuntimeError,
    protocol::{Failure, Signal, VPid},
    stream::{pipe_to, ByteReader, ByteWriter},
    transfer::Spawned,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeMap;

/// Something that can start processes and collect their status
///
/// The host spawns through the kernel directly, while programs like the
/// shell spawn through their own syscall channel.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        entrypoint: &str,
        argv: Vec<String>,
        cwd: &str,
        env: BTreeMap<String, String>,
    ) -> Result<Spawned, Failure>;

    async fn wait(&self, pid: VPid) -> Result<i32, Failure>;

    async fn kill(&self, pid: VPid, signal: Signal) -> Result<(), Failure>;
}

/// One stage of a command line
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Command {
    /// `NAME=value` assignments written before the command
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

impl Command {
    /// A stage with no command, only assignments
    pub fn is_assignment(&self) -> bool {
        self.argv.is_empty()
    }
}

#[derive(Debug)]
enum Token {
    Word { text: String, assignment: Option<usize> },
    Pipe,
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn tokenize(line: &str) -> Result<Vec<Token>, RuntimeError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => return Ok(tokens),
            Some('|') => {
                chars.next();
                tokens.push(Token::Pipe);
                continue;
            }
            Some(_) => {}
        }
        let mut text = String::new();
        let mut quoted = false;
        let mut assignment = None;
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() || c == '|' {
                break;
            }
            chars.next();
            match c {
                '"' => {
                    quoted = true;
                    loop {
                        match chars.next() {
                            None => return Err(RuntimeError::Syntax("unterminated \"".to_string())),
                            Some('"') => break,
                            Some('\\') => match chars.next() {
                                Some(escaped @ '"') | Some(escaped @ '\\') => text.push(escaped),
                                Some(other) => {
                                    text.push('\\');
                                    text.push(other);
                                }
                                None => {
                                    return Err(RuntimeError::Syntax("unterminated \"".to_string()))
                                }
                            },
                            Some(other) => text.push(other),
                        }
                    }
                }
                '\'' => {
                    quoted = true;
                    loop {
                        match chars.next() {
                            None => return Err(RuntimeError::Syntax("unterminated '".to_string())),
                            Some('\'') => break,
                            Some(other) => text.push(other),
                        }
                    }
                }
                '=' if !quoted && assignment.is_none() => {
                    assignment = Some(text.len());
                    text.push(c);
                }
                _ => text.push(c),
            }
        }
        let assignment = assignment.filter(|&at| is_name(&text[..at]));
        tokens.push(Token::Word { text, assignment });
    }
}

/// Split a command line into stages
///
/// An empty line gives no stages. A line of only assignments gives one
/// stage with an empty argv.
pub fn parse(line: &str) -> Result<Vec<Command>, RuntimeError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let mut commands = vec![Command::default()];
    for token in tokens {
        match token {
            Token::Pipe => commands.push(Command::default()),
            Token::Word { text, assignment } => {
                let command = commands.last_mut().ok_or(RuntimeError::EmptyCommand)?;
                match assignment {
                    Some(at) if command.argv.is_empty() => {
                        command
                            .env
                            .insert(text[..at].to_string(), text[at + 1..].to_string());
                    }
                    _ => command.argv.push(text),
                }
            }
        }
    }
    if commands.len() > 1 && commands.iter().any(Command::is_assignment) {
        return Err(RuntimeError::Syntax("expected a command around |".to_string()));
    }
    Ok(commands)
}

/// Copy every error stream into one sink as chunks arrive
async fn fan_in(readers: Vec<ByteReader>, mut sink: ByteWriter) {
    let streams = readers.into_iter().map(|reader| {
        stream::unfold(reader, |mut reader| async move {
            match reader.read().await {
                Ok(Some(chunk)) => Some((chunk, reader)),
                _ => None,
            }
        })
        .boxed()
    });
    let mut merged = stream::select_all(streams);
    while let Some(chunk) = merged.next().await {
        if let Err(err) = sink.write(chunk).await {
            log::debug!("error sink closed, {}", err);
            return;
        }
    }
    sink.close();
}

/// Tear down the stages that did start, keeping what they already wrote
async fn abandon<S: Spawner + ?Sized>(
    spawner: &S,
    spawned: Vec<Spawned>,
    mut output: ByteWriter,
    mut errors: ByteWriter,
) {
    for stage in &spawned {
        if let Err(err) = spawner.kill(stage.pid, Signal::SIGKILL).await {
            log::debug!("pid {} already gone, {}", stage.pid, err);
        }
    }
    for mut stage in spawned {
        let written = stage.stdout.take_buffered();
        let complained = stage.stderr.take_buffered();
        if output.write(written).await.is_err() || errors.write(complained).await.is_err() {
            break;
        }
    }
}

/// Run parsed stages as one pipeline, returning the last stage's status
///
/// `input` feeds the first stage and the last stage's output goes to
/// `output`. Every stage's error stream is copied into `errors`. Each
/// stage's environment is `env` plus its own assignments.
pub async fn run<S: Spawner + ?Sized>(
    spawner: &S,
    commands: Vec<Command>,
    cwd: &str,
    env: &BTreeMap<String, String>,
    input: ByteReader,
    output: ByteWriter,
    errors: ByteWriter,
) -> Result<i32, RuntimeError> {
    if commands.is_empty() || commands.iter().any(Command::is_assignment) {
        return Err(RuntimeError::EmptyCommand);
    }
    let mut spawned = Vec::with_capacity(commands.len());
    for command in commands {
        let mut stage_env = env.clone();
        stage_env.extend(command.env);
        let entrypoint = command.argv[0].clone();
        match spawner.spawn(&entrypoint, command.argv, cwd, stage_env).await {
            Ok(stage) => spawned.push(stage),
            Err(failure) => {
                log::debug!("pipeline stage {:?} failed to start, {}", entrypoint, failure);
                abandon(spawner, spawned, output, errors).await;
                return Err(failure.into());
            }
        }
    }

    let mut pids = Vec::with_capacity(spawned.len());
    let mut stderrs = Vec::with_capacity(spawned.len());
    let mut transfers = Vec::with_capacity(spawned.len() + 1);
    let mut previous = input;
    for stage in spawned {
        transfers.push(tokio::spawn(pipe_to(previous, stage.stdin)));
        previous = stage.stdout;
        stderrs.push(stage.stderr);
        pids.push(stage.pid);
    }
    transfers.push(tokio::spawn(pipe_to(previous, output)));
    let errors = tokio::spawn(fan_in(stderrs, errors));

    let mut status = 0;
    for pid in pids {
        status = spawner.wait(pid).await?;
    }
    for transfer in transfers {
        if let Err(err) = transfer.await? {
            log::trace!("pipe settled early, {}", err);
        }
    }
    errors.await?;
    Ok(status)
}
