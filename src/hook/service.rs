use std::io;

//===========================================================================//

/// Service ID of the built-in [`ConsoleService`].
pub const SVC_CONSOLE: u8 = 0x01;

/// Service ID of the built-in [`EchoService`].
pub const SVC_ECHO: u8 = 0x02;

//===========================================================================//

/// A handler for I/O hook calls made by the traced target.
pub trait Service {
    /// Handles one call and returns the response bytes, if any.  An empty
    /// response leaves the hook's response region untouched.
    ///
    /// Handlers run on the capture thread and must not block.
    fn call(&mut self, request: &[u8]) -> Vec<u8>;
}

impl<F: FnMut(&[u8]) -> Vec<u8>> Service for F {
    fn call(&mut self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

//===========================================================================//

/// Copies text sent by the target to a host-side writer.  Never responds.
pub struct ConsoleService<W> {
    output: W,
}

impl<W: io::Write> ConsoleService<W> {
    /// Returns a console service that writes to `output`.
    pub fn new(output: W) -> ConsoleService<W> {
        ConsoleService { output }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.output
    }
}

impl<W: io::Write> Service for ConsoleService<W> {
    fn call(&mut self, request: &[u8]) -> Vec<u8> {
        let result =
            self.output.write_all(request).and_then(|()| self.output.flush());
        if let Err(error) = result {
            log::warn!("console output failed: {error}");
        }
        Vec::new()
    }
}

//===========================================================================//

/// Responds to every call with a copy of its request.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoService;

impl Service for EchoService {
    fn call(&mut self, request: &[u8]) -> Vec<u8> {
        request.to_vec()
    }
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::{ConsoleService, EchoService, Service};

    #[test]
    fn console_copies_text() {
        let mut console = ConsoleService::new(Vec::new());
        assert!(console.call(b"hello, ").is_empty());
        assert!(console.call(b"world\n").is_empty());
        assert_eq!(console.into_inner(), b"hello, world\n");
    }

    #[test]
    fn echo_repeats_request() {
        assert_eq!(EchoService.call(b"ping"), b"ping");
        assert!(EchoService.call(&[]).is_empty());
    }

    #[test]
    fn closures_are_services() {
        let mut calls = 0;
        let mut service = |request: &[u8]| {
            calls += 1;
            vec![request.len() as u8]
        };
        assert_eq!(Service::call(&mut service, b"abc"), vec![3]);
        assert_eq!(calls, 1);
    }
}

//===========================================================================//
