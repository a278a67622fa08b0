use crate::{
    errors::ProcessError,
    local::{LocalProcess, STDIN, STDOUT},
    protocol::{exit, FileKind, WriteMode},
};

/// Copy a readable descriptor to stdout until end of stream
async fn copy_out(process: &LocalProcess, fd: u32) -> Result<(), ProcessError> {
    while let Some(chunk) = process.read(fd).await? {
        process.write(STDOUT, chunk).await?;
    }
    Ok(())
}

pub async fn cat(process: LocalProcess) -> Result<i32, ProcessError> {
    let paths = &process.argv()[1..];
    if paths.is_empty() {
        copy_out(&process, STDIN).await?;
        return Ok(exit::EXIT_OK);
    }
    let mut status = exit::EXIT_OK;
    for path in paths {
        if path == "-" {
            copy_out(&process, STDIN).await?;
            continue;
        }
        let fd = match process.open_read(path).await {
            Ok(fd) => fd,
            Err(err) => {
                super::complain(&process, &format!("{}: {}", path, err)).await;
                status = exit::EXIT_FAILURE;
                continue;
            }
        };
        let copied = copy_out(&process, fd).await;
        process.close(fd)?;
        if let Err(err) = copied {
            super::complain(&process, &format!("{}: {}", path, err)).await;
            status = exit::EXIT_FAILURE;
        }
    }
    Ok(status)
}

pub async fn tee(process: LocalProcess) -> Result<i32, ProcessError> {
    let mut args = &process.argv()[1..];
    let mode = match args.first() {
        Some(flag) if flag == "-a" => {
            args = &args[1..];
            WriteMode::After
        }
        _ => WriteMode::Override,
    };
    let mut status = exit::EXIT_OK;
    let mut outputs = vec![STDOUT];
    for path in args {
        match process.open_write(path, mode, true).await {
            Ok(fd) => outputs.push(fd),
            Err(err) => {
                super::complain(&process, &format!("{}: {}", path, err)).await;
                status = exit::EXIT_FAILURE;
            }
        }
    }
    while let Some(chunk) = process.read(STDIN).await? {
        for fd in &outputs {
            process.write(*fd, &chunk).await?;
        }
    }
    for fd in outputs.into_iter().skip(1) {
        process.close(fd)?;
    }
    Ok(status)
}

pub async fn ls(process: LocalProcess) -> Result<i32, ProcessError> {
    let mut paths: Vec<String> = process.argv()[1..].to_vec();
    let all = paths.first().map(String::as_str) == Some("-a");
    if all {
        paths.remove(0);
    }
    if paths.is_empty() {
        paths.push(".".to_string());
    }
    let heading = paths.len() > 1;
    let mut status = exit::EXIT_OK;
    for path in paths {
        let fd = match process.open_dir(&path).await {
            Ok(fd) => fd,
            Err(err) => {
                if let Ok(true) = process.access(&path).await {
                    process.write(STDOUT, format!("{}\n", path)).await?;
                } else {
                    super::complain(&process, &format!("{}: {}", path, err)).await;
                    status = exit::EXIT_FAILURE;
                }
                continue;
            }
        };
        let mut listing = String::new();
        if heading {
            listing.push_str(&format!("{}:\n", path));
        }
        loop {
            match process.next_entry(fd).await {
                Ok(Some(entry)) if !all && (entry.name == "." || entry.name == "..") => {}
                Ok(Some(entry)) => {
                    listing.push_str(&entry.name);
                    if entry.kind == FileKind::Directory {
                        listing.push('/');
                    }
                    listing.push('\n');
                }
                Ok(None) => break,
                Err(err) => {
                    super::complain(&process, &format!("{}: {}", path, err)).await;
                    status = exit::EXIT_FAILURE;
                    break;
                }
            }
        }
        process.close(fd)?;
        process.write(STDOUT, listing).await?;
    }
    Ok(status)
}

pub async fn rm(process: LocalProcess) -> Result<i32, ProcessError> {
    let mut args = &process.argv()[1..];
    let recursive = match args.first() {
        Some(flag) if flag == "-r" || flag == "-rf" => {
            args = &args[1..];
            true
        }
        _ => false,
    };
    let mut status = exit::EXIT_OK;
    for path in args {
        if let Err(err) = process.unlink(path, recursive).await {
            super::complain(&process, &format!("{}: {}", path, err)).await;
            status = exit::EXIT_FAILURE;
        }
    }
    Ok(status)
}
