#[macro_use]
extern crate clap;

use clap::{App, ArgMatches};
use env_logger::{from_env, Env};
use minikernel::{
    commands,
    filesystem::{HostPermissions, HttpFS, NativeFS, NullFS},
    pipeline,
    stream::{pipe, ByteReader, ByteWriter, DEFAULT_HIGH_WATER_MARK},
    HostSpawner, Kernel, PathSearch,
};
use std::{collections::BTreeMap, io, sync::Arc, time::Duration};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[tokio::main]
async fn main() {
    let yaml = load_yaml!("cli.yml");
    let matches = App::from_yaml(yaml).get_matches();

    let log_level = matches.value_of("log_level").unwrap();
    from_env(Env::default().default_filter_or(log_level)).init();

    let mut builder = Kernel::builder().mount("/dev", Arc::new(NullFS));
    if let Some(dir) = matches.value_of("host_dir") {
        let permissions = if matches.is_present("read_only") {
            HostPermissions::read_only()
        } else {
            HostPermissions::read_write()
        };
        builder = builder.mount("/", Arc::new(NativeFS::new(dir, permissions)));
    }
    for (path, url) in pairs(&matches, "mount_http") {
        let url = url.parse().expect("bad url for --mount-http");
        let driver = HttpFS::new(url).expect("failed to set up HTTP filesystem");
        builder = builder.mount(path.as_str(), Arc::new(driver));
    }
    if let Some(ms) = matches.value_of("grace") {
        let ms = ms.parse().expect("--grace takes a number of milliseconds");
        builder = builder.grace_period(Duration::from_millis(ms));
    }
    if matches.is_present("reverse_path") {
        builder = builder.path_search(PathSearch::ReverseOrder);
    }
    let kernel = commands::boot(builder).await.expect("failed to boot kernel");

    let mut env: BTreeMap<String, String> = pairs(&matches, "env").into_iter().collect();
    env.entry("PATH".to_string())
        .or_insert_with(|| commands::DEFAULT_PATH.to_string());

    let (input_writer, input) = pipe(DEFAULT_HIGH_WATER_MARK);
    let (output, output_reader) = pipe(DEFAULT_HIGH_WATER_MARK);
    let (errors, errors_reader) = pipe(DEFAULT_HIGH_WATER_MARK);
    tokio::spawn(feed(tokio::io::stdin(), input_writer));
    let stdout = tokio::spawn(drain(output_reader, tokio::io::stdout()));
    let stderr = tokio::spawn(drain(errors_reader, tokio::io::stderr()));

    let commands = match matches.value_of("command") {
        Some(line) => pipeline::parse(line),
        None => Ok(vec![pipeline::Command {
            env: BTreeMap::new(),
            argv: vec!["sh".to_string()],
        }]),
    };
    let spawner = HostSpawner::new(kernel);
    let result = match commands {
        Ok(commands) => pipeline::run(&spawner, commands, "/", &env, input, output, errors).await,
        Err(err) => {
            drop((output, errors));
            Err(err)
        }
    };
    for (name, forward) in vec![("stdout", stdout), ("stderr", stderr)] {
        match forward.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("forwarding {} failed, {}", name, err),
            Err(err) => log::warn!("forwarding {} panicked, {}", name, err),
        }
    }
    match result {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            eprintln!("minikernel: {}", err);
            std::process::exit(err.exit_code());
        }
    }
}

/// Host input into a pipe, until either side ends
async fn feed<R: AsyncRead + Unpin>(mut source: R, mut writer: ByteWriter) {
    let mut buf = vec![0u8; 4096];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => return,
            Ok(len) => {
                if writer.write_all(&buf[..len]).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                writer.abort(err.to_string());
                return;
            }
        }
    }
}

/// A pipe out to host output, until end of stream
async fn drain<W: AsyncWrite + Unpin>(mut reader: ByteReader, mut sink: W) -> io::Result<()> {
    loop {
        let chunk = reader
            .read()
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err))?;
        match chunk {
            Some(chunk) => {
                sink.write_all(&chunk).await?;
                sink.flush().await?;
            }
            None => return Ok(()),
        }
    }
}

fn string_values<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<String> {
    matches
        .values_of(name)
        .into_iter()
        .map(|values| values.map(|value| value.to_string()))
        .flatten()
        .collect()
}

fn pairs<S: AsRef<str>>(matches: &ArgMatches, name: S) -> Vec<(String, String)> {
    string_values(matches, name)
        .iter()
        .map(|pair_str| {
            let mut parts = pair_str.splitn(2, '=');
            (
                parts.next().unwrap().to_string(),
                parts.next().unwrap_or("").to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    #[test]
    fn drain_reports_broken_streams() {
        Runtime::new().unwrap().block_on(async {
            let (writer, reader) = pipe(16);
            writer.abort("producer crashed");
            let err = drain(reader, Vec::new()).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
            assert!(err.to_string().contains("producer crashed"), "{}", err);

            let (writer, reader) = pipe(16);
            drop(writer);
            assert!(drain(reader, Vec::new()).await.is_ok());
        });
    }
}
