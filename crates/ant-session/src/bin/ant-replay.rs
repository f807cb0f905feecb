use std::{env, fs, sync::Arc};

use anyhow::{Context as _, bail};
use ant_core::{Codec, Direction, Registry, Tokenizer};
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[expect(
    clippy::print_stdout,
    reason = "decoded messages are the program's output"
)]
fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::ERROR.into())
                .with_env_var("ANT_LOG")
                .from_env_lossy(),
        )
        .init();

    let mut direction = Direction::DeviceToHost;
    let mut path = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--host" => direction = Direction::HostToDevice,
            _ if path.is_none() => path = Some(arg),
            _ => bail!("usage: ant-replay [--host] <capture>"),
        }
    }
    let Some(path) = path else {
        bail!("usage: ant-replay [--host] <capture>");
    };
    let bytes = fs::read(&path).with_context(|| format!("reading {path}"))?;

    let codec = Codec::new(Arc::new(Registry::new()));
    let mut tokenizer = Tokenizer::default();
    tokenizer.push(&bytes);
    for frame in tokenizer.by_ref() {
        match codec.unpack_with(direction, &frame) {
            Some(msg) => println!("{msg}"),
            None => warn!("dropped frame {frame:02x?}"),
        }
    }
    if tokenizer.pending() > 0 {
        warn!("{} trailing bytes", tokenizer.pending());
    }
    Ok(())
}
