use crate::{
    errors::ProcessError,
    local::{LocalProcess, STDOUT},
    protocol::exit,
};
use std::time::Duration;

pub async fn echo(process: LocalProcess) -> Result<i32, ProcessError> {
    let mut args = &process.argv()[1..];
    let newline = match args.first() {
        Some(flag) if flag == "-n" => {
            args = &args[1..];
            false
        }
        _ => true,
    };
    let mut line = args.join(" ");
    if newline {
        line.push('\n');
    }
    process.write(STDOUT, line).await?;
    Ok(exit::EXIT_OK)
}

pub async fn env(process: LocalProcess) -> Result<i32, ProcessError> {
    let mut listing = String::new();
    for (key, value) in process.env() {
        listing.push_str(&format!("{}={}\n", key, value));
    }
    process.write(STDOUT, listing).await?;
    Ok(exit::EXIT_OK)
}

pub async fn pwd(process: LocalProcess) -> Result<i32, ProcessError> {
    process.write(STDOUT, format!("{}\n", process.cwd())).await?;
    Ok(exit::EXIT_OK)
}

pub async fn sleep(process: LocalProcess) -> Result<i32, ProcessError> {
    let seconds = match process.argv().get(1).map(|arg| arg.parse::<f64>()) {
        Some(Ok(seconds)) if seconds >= 0.0 && seconds.is_finite() => seconds,
        _ => {
            super::complain(&process, "usage: sleep SECONDS").await;
            return Ok(exit::EXIT_FAILURE);
        }
    };
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    Ok(exit::EXIT_OK)
}

pub async fn succeed(_process: LocalProcess) -> Result<i32, ProcessError> {
    Ok(exit::EXIT_OK)
}

pub async fn fail(_process: LocalProcess) -> Result<i32, ProcessError> {
    Ok(exit::EXIT_FAILURE)
}
