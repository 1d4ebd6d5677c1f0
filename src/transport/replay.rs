use super::Transport;
use std::collections::HashMap;
use std::io::{self, Read};

//===========================================================================//

/// A transport that replays a previously captured raw trace stream.
///
/// Register writes are accepted and recorded, but have no effect on the
/// replayed stream.
pub struct ReplayTransport<R> {
    reader: R,
    chunk_size: usize,
    registers: HashMap<u16, u16>,
    writes: Vec<(u16, u16)>,
}

impl<R: Read> ReplayTransport<R> {
    /// The chunk size used unless overridden with
    /// [`ReplayTransport::with_chunk_size`].
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Returns a transport that replays the bytes read from `reader`.
    pub fn new(reader: R) -> ReplayTransport<R> {
        ReplayTransport {
            reader,
            chunk_size: ReplayTransport::<R>::DEFAULT_CHUNK_SIZE,
            registers: HashMap::new(),
            writes: Vec::new(),
        }
    }

    /// Sets the largest chunk that [`Transport::read_chunk`] will deliver.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> ReplayTransport<R> {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Returns the last value written to the given register, or zero.
    pub fn register(&self, addr: u16) -> u16 {
        self.registers.get(&addr).copied().unwrap_or(0)
    }

    /// Returns every register write so far, in order.
    pub fn writes(&self) -> &[(u16, u16)] {
        &self.writes
    }
}

impl<R: Read> Transport for ReplayTransport<R> {
    fn write_register(&mut self, addr: u16, value: u16) -> io::Result<()> {
        self.registers.insert(addr, value);
        self.writes.push((addr, value));
        Ok(())
    }

    fn read_register(&mut self, addr: u16) -> io::Result<u16> {
        Ok(self.register(addr))
    }

    fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_chunk(&mut self, buffer: &mut Vec<u8>) -> io::Result<bool> {
        buffer.resize(self.chunk_size, 0);
        loop {
            match self.reader.read(buffer) {
                Ok(0) => {
                    buffer.clear();
                    return Ok(false);
                }
                Ok(len) => {
                    buffer.truncate(len);
                    return Ok(true);
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
    }
}

//===========================================================================//

#[cfg(test)]
mod tests {
    use super::ReplayTransport;
    use crate::transport::Transport;

    #[test]
    fn replays_in_chunks() {
        let data: Vec<u8> = (0..10).collect();
        let mut transport =
            ReplayTransport::new(data.as_slice()).with_chunk_size(4);
        let mut buffer = Vec::new();
        let mut chunks = Vec::new();
        while transport.read_chunk(&mut buffer).unwrap() {
            chunks.push(buffer.clone());
        }
        assert_eq!(
            chunks,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn records_register_writes() {
        let mut transport = ReplayTransport::new(&[][..]);
        transport.write_registers(&[(0x10, 1), (0x11, 2)]).unwrap();
        transport.write_register(0x10, 3).unwrap();
        assert_eq!(transport.writes(), &[(0x10, 1), (0x11, 2), (0x10, 3)]);
        assert_eq!(transport.read_register(0x10).unwrap(), 3);
        assert_eq!(transport.read_register(0x12).unwrap(), 0);
    }
}

//===========================================================================//
