use std::convert::TryInto;
use std::io::{self, prelude::*};

/// Compute the log-base-two of the next power of two: 8 -> 3, 9 -> 4.
///
pub fn ceil_log2(x: usize) -> usize {
    let mut n = 0;
    while 1 << n < x {
        n += 1
    }
    n
}

/// Decode a little-endian `f64` from the first eight bytes of a buffer.
///
pub fn f64_from_bytes(bytes: &[u8]) -> f64 {
    let head: [u8; 8] = bytes[..8]
        .try_into()
        .expect("reduction buffer shorter than eight bytes");
    f64::from_le_bytes(head)
}

/// Read a usize out of the given stream.
///
pub fn read_usize<R: Read>(stream: &mut R) -> io::Result<usize> {
    read_bytes_array(stream).map(usize::from_le_bytes)
}

/// Read the given number of bytes from a stream, into a vec.
///
pub fn read_bytes_vec<R: Read>(stream: &mut R, size: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0; size];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Read the given (const) number of bytes from a stream, into an array.
///
pub fn read_bytes_array<R: Read, const SIZE: usize>(stream: &mut R) -> io::Result<[u8; SIZE]> {
    let mut buffer = [0; SIZE];
    stream.read_exact(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ceil_log2_rounds_up() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(8), 3);
        assert_eq!(ceil_log2(9), 4);
    }

    #[test]
    fn framed_reads_consume_the_stream() {
        let mut bytes = 3usize.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[7, 8, 9]);
        let mut stream = io::Cursor::new(bytes);
        let size = read_usize(&mut stream).unwrap();
        assert_eq!(read_bytes_vec(&mut stream, size).unwrap(), vec![7, 8, 9]);
    }
}
