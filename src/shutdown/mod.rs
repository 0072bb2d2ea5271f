use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Owns the stop flag the accept loop polls. SIGINT and SIGTERM set it;
/// `request_stop` does the same from code.
pub struct ShutdownHooks {
    stop_flag: Arc<AtomicBool>,
    #[cfg(unix)]
    registrations: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let registrations = [SIGINT, SIGTERM]
                .into_iter()
                .map(|signal| flag::register(signal, Arc::clone(&stop_flag)))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Self {
                stop_flag,
                registrations,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { stop_flag })
        }
    }

    /// Hooks with no OS signal registration, for embedding and tests.
    pub fn manual() -> Self {
        Self {
            stop_flag: Arc::new(AtomicBool::new(false)),
            #[cfg(unix)]
            registrations: Vec::new(),
        }
    }

    pub fn signal(&self) -> &AtomicBool {
        &self.stop_flag
    }

    pub fn shared_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.registrations.drain(..) {
            unregister(id);
        }
    }
}
