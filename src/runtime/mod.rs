//! Task execution for connection handlers.
//!
//! Every transport operation is a blocking syscall and a connection may stay
//! idle indefinitely, so each handler gets a dedicated OS thread. There is no
//! pool to exhaust. Each task runs under a fault boundary: a panic is logged
//! and ends only that task.

mod connection;

pub use connection::{ConnectionRegistry, Registration};

#[cfg(test)]
pub(crate) use connection::tests::StubConn;

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::error;

/// Run `task` on a new named thread, containing any panic.
///
/// The returned handle resolves to `false` if the task panicked. If the
/// thread cannot be spawned, `task` is dropped without running.
pub fn spawn_supervised<F>(name: &'static str, task: F) -> io::Result<JoinHandle<bool>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => true,
            Err(payload) => {
                error!(
                    task = name,
                    panic = %panic_message(payload.as_ref()),
                    "Recovered from panic in task"
                );
                false
            }
        })
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_task_completes() {
        let handle = spawn_supervised("ok", || {}).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_thread_is_named() {
        let handle = spawn_supervised("echo-conn", || {
            assert_eq!(thread::current().name(), Some("echo-conn"));
        })
        .unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_panic_is_contained_and_cleanup_runs() {
        let registry = Arc::new(ConnectionRegistry::new());
        let conn = StubConn::new("10.1.1.1:4000");
        let guard = Registration::register(&registry, Arc::clone(&conn)).unwrap();

        let handle = spawn_supervised("connection", move || {
            let _guard = guard;
            panic!("handler blew up");
        })
        .unwrap();

        assert!(!handle.join().unwrap());
        assert!(registry.is_empty());
        assert_eq!(conn.close_count(), 1);
    }

    #[test]
    fn test_tasks_run_concurrently() {
        // Every task blocks until all of them are running at once.
        const TASKS: usize = 64;
        let barrier = Arc::new(Barrier::new(TASKS));
        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                spawn_supervised("blocked", move || {
                    barrier.wait();
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
