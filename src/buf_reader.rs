/// Bounds-checked reads over a byte slice, similar to std::io::Cursor with
/// big-endian accessors.
pub struct BufReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BufReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16_be(&mut self) -> std::io::Result<u16> {
        if self.pos + 1 >= self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u24_be(&mut self) -> std::io::Result<u32> {
        if self.pos + 2 >= self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        let value = u32::from_be_bytes([
            0,
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
        ]);
        self.pos += 3;
        Ok(value)
    }

    pub fn read_u32_be(&mut self) -> std::io::Result<u32> {
        if self.pos + 3 >= self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        let value = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(value)
    }

    pub fn read_slice(&mut self, len: usize) -> std::io::Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, amount: usize) -> std::io::Result<()> {
        if self.pos + amount > self.buf.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Read past end of buffer",
            ));
        }
        self.pos += amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_and_bounds() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut reader = BufReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16_be().unwrap(), 0x0203);
        assert_eq!(reader.read_u24_be().unwrap(), 0x040506);
        assert_eq!(reader.remaining(), 1);
        assert!(reader.read_u16_be().is_err());
        assert_eq!(reader.read_u8().unwrap(), 0x07);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_read_u32_be() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let mut reader = BufReader::new(&data);
        assert_eq!(reader.read_u32_be().unwrap(), 0xdeadbeef);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_read_slice() {
        let data = [0xaa, 0xbb, 0xcc];
        let mut reader = BufReader::new(&data);
        assert_eq!(reader.read_slice(2).unwrap(), &[0xaa, 0xbb]);
        assert!(reader.read_slice(2).is_err());
        assert_eq!(reader.position(), 2);
    }
}
