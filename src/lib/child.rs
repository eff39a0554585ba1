//! Request loop run inside a worker process.
//!
//! The loop answers requests strictly in order. A request that cannot be
//! decoded, or a kernel that fails, ends the loop with an error; the binary
//! then exits non-zero and the parent observes a crash like any other.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};

use nix::unistd::{dup, dup2};
use thiserror::Error;
use tracing::{debug, info};

use crate::ipc::{read_frame, write_frame, ProtocolError, Request, Response};
use crate::kernel::KernelError;
use crate::runtime::Runtime;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("benchmark of {task} failed: {source}")]
    Kernel {
        task: String,
        #[source]
        source: KernelError,
    },
}

/// Why the request loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The parent sent `Stop`.
    Requested,
    /// The request channel reached end of stream.
    ParentGone,
}

/// Serve requests until `Stop`, end of stream, or the first failure.
pub fn serve<R: Read, W: Write>(
    requests: &mut R,
    responses: &mut W,
    runtime: &Runtime,
) -> Result<Shutdown, ServeError> {
    let mut served = 0usize;
    loop {
        let request = match read_frame::<_, Request>(requests)? {
            Some(request) => request,
            None => {
                info!("[CHILD:STOP] Request channel closed after {} task(s)", served);
                return Ok(Shutdown::ParentGone);
            }
        };

        match request {
            Request::Ping => {
                debug!("[CHILD:PING] Answering handshake");
                write_frame(responses, &Response::Pong)?;
            }
            Request::Stop => {
                info!("[CHILD:STOP] Stop requested after {} task(s)", served);
                return Ok(Shutdown::Requested);
            }
            Request::Benchmark(task) => {
                let latency = task
                    .benchmark(runtime)
                    .map_err(|source| ServeError::Kernel {
                        task: task.to_string(),
                        source,
                    })?;
                debug!("[CHILD:BENCH] {} -> {:.4} ms", task, latency);
                write_frame(responses, &Response::Latency(latency))?;
                served += 1;
            }
        }
    }
}

/// Move the process's stdout to a private descriptor and point descriptor 1
/// at stderr. Returns the private handle, which becomes the response channel;
/// anything else printing to stdout afterwards lands on stderr.
pub fn take_stdout() -> io::Result<File> {
    io::stdout().flush()?;
    let stdout_fd = io::stdout().as_raw_fd();
    let private = dup(stdout_fd)?;
    dup2(io::stderr().as_raw_fd(), stdout_fd)?;
    // SAFETY: `private` was just returned by dup and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(private) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::kernel::HostKernel;
    use crate::loader::{manifest_path, ModuleManifest};
    use crate::model::{DType, Device, TensorSpec};
    use crate::task::BenchmarkTask;
    use crate::timing::BenchTimer;

    fn frames(requests: &[serde_json::Value]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for request in requests {
            write_frame(&mut buf, request).unwrap();
        }
        Cursor::new(buf)
    }

    fn encode(requests: &[Request]) -> Cursor<Vec<u8>> {
        let values: Vec<_> = requests
            .iter()
            .map(|r| serde_json::to_value(r).unwrap())
            .collect();
        frames(&values)
    }

    fn decode(buf: Vec<u8>) -> Vec<Response> {
        let mut cursor = Cursor::new(buf);
        let mut out = Vec::new();
        while let Some(response) = read_frame(&mut cursor).unwrap() {
            out.push(response);
        }
        out
    }

    fn runtime() -> Runtime {
        Runtime::host().with_timer(Arc::new(BenchTimer::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
        )))
    }

    #[test]
    fn test_ping_then_stop() {
        let mut input = encode(&[Request::Ping, Request::Stop, Request::Ping]);
        let mut output = Vec::new();
        let shutdown = serve(&mut input, &mut output, &runtime()).unwrap();
        assert_eq!(shutdown, Shutdown::Requested);
        // Nothing after Stop is answered.
        assert_eq!(decode(output), vec![Response::Pong]);
    }

    #[test]
    fn test_eof_means_parent_gone() {
        let mut input = encode(&[Request::Ping]);
        let mut output = Vec::new();
        assert_eq!(
            serve(&mut input, &mut output, &runtime()).unwrap(),
            Shutdown::ParentGone
        );
    }

    #[test]
    fn test_unknown_request_is_fatal() {
        let mut input = frames(&[
            serde_json::to_value(Request::Ping).unwrap(),
            serde_json::json!({"kind": "compile", "task": "x"}),
        ]);
        let mut output = Vec::new();
        let result = serve(&mut input, &mut output, &runtime());
        assert!(matches!(result, Err(ServeError::Protocol(ProtocolError::Decode(_)))));
        assert_eq!(decode(output), vec![Response::Pong]);
    }

    #[test]
    fn test_benchmark_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest_path(dir.path(), "ops");
        ModuleManifest::new("ops-key")
            .with_entry_point("add", HostKernel::Add)
            .with_entry_point("copy", HostKernel::Copy)
            .write_to(&path)
            .unwrap();
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![32]);
        let add = BenchmarkTask::new(
            "ops-key",
            &path,
            "add",
            vec![spec.clone(), spec.clone()],
            spec.clone(),
        );
        let copy = BenchmarkTask::new("ops-key", &path, "copy", spec.clone(), spec);

        let mut input = encode(&[
            Request::Ping,
            Request::Benchmark(Box::new(add)),
            Request::Benchmark(Box::new(copy)),
        ]);
        let mut output = Vec::new();
        serve(&mut input, &mut output, &runtime()).unwrap();

        let responses = decode(output);
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], Response::Pong);
        for response in &responses[1..] {
            match response {
                Response::Latency(ms) => assert!(ms.is_finite() && *ms >= 0.0),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_kernel_failure_ends_loop() {
        let dir = tempfile::tempdir().unwrap();
        let path = manifest_path(dir.path(), "bad");
        ModuleManifest::new("bad-key")
            .with_entry_point("boom", HostKernel::Fail)
            .write_to(&path)
            .unwrap();
        let spec = TensorSpec::contiguous(Device::Cpu, DType::F32, vec![4]);
        let task = BenchmarkTask::new("bad-key", &path, "boom", spec.clone(), spec);

        let mut input = encode(&[Request::Benchmark(Box::new(task)), Request::Ping]);
        let mut output = Vec::new();
        let result = serve(&mut input, &mut output, &runtime());
        assert!(matches!(result, Err(ServeError::Kernel { .. })));
        assert!(output.is_empty());
    }
}
