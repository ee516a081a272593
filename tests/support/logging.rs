use std::io::{self, Write};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter};

type Buffer = Arc<Mutex<Vec<u8>>>;

#[derive(Clone)]
struct SharedWriter {
    buffer: Buffer,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

static BUFFER: OnceLock<Buffer> = OnceLock::new();
static EXCLUSIVE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Routes tracing output into a shared buffer. The subscriber is global, so
/// captures are serialized; the filter of the first capture wins.
pub struct LogCapture {
    buffer: Buffer,
    _permit: OwnedSemaphorePermit,
}

impl LogCapture {
    pub async fn new(filter: &str) -> Self {
        let permit = EXCLUSIVE
            .get_or_init(|| Arc::new(Semaphore::new(1)))
            .clone()
            .acquire_owned()
            .await
            .expect("log capture semaphore closed");
        let buffer = BUFFER
            .get_or_init(|| {
                let buffer = Buffer::default();
                let subscriber = fmt::fmt()
                    .with_env_filter(EnvFilter::new(filter))
                    .with_ansi(false)
                    .without_time()
                    .compact()
                    .with_writer(SharedWriter {
                        buffer: buffer.clone(),
                    })
                    .finish();
                let _ = tracing::subscriber::set_global_default(subscriber);
                buffer
            })
            .clone();
        buffer.lock().unwrap_or_else(|err| err.into_inner()).clear();
        Self {
            buffer,
            _permit: permit,
        }
    }

    pub fn text(&self) -> String {
        let guard = self.buffer.lock().unwrap_or_else(|err| err.into_inner());
        String::from_utf8_lossy(&guard).into_owned()
    }

    /// Lines emitted under `target`.
    pub fn lines_for(&self, target: &str) -> Vec<String> {
        let prefix = format!("{target}:");
        self.text()
            .lines()
            .filter(|line| line.contains(&prefix))
            .map(str::to_string)
            .collect()
    }
}
