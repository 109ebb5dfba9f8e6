use std::io::{Cursor, Error, ErrorKind, Read};
use std::mem::size_of;

/// Little-endian reads off an in-memory IL stream.
pub(crate) trait FromByteStream where Self: Sized {
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self>;
}

impl FromByteStream for u8 {
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
		let mut byte = 0u8;
		stream.read_exact(std::slice::from_mut(&mut byte))?;
		Ok(byte)
	}
}

impl<const SIZE: usize> FromByteStream for [u8; SIZE] {
	#[inline]
	fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
		let mut bytes = [0u8; SIZE];
		stream.read_exact(&mut bytes)?;
		Ok(bytes)
	}
}

macro_rules! impl_from_le_byte_stream {
	($($ty: ty),*) => {$(
		impl FromByteStream for $ty {
			#[inline]
			fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
				let bytes = <[u8; size_of::<Self>()]>::read(stream)?;
				Ok(Self::from_le_bytes(bytes))
			}
		}
	)*};
}

impl_from_le_byte_stream!(i8, u16, i16, u32, i32, u64, i64, f32, f64);

#[inline]
pub(crate) fn read_bytes_slice_from_stream<'l>(stream: &mut Cursor<&'l [u8]>, count: usize) -> std::io::Result<&'l [u8]> {
	let start = stream.position() as usize;
	let end = match start.checked_add(count) {
		Some(end) if end <= stream.get_ref().len() => end,
		_ => return Err(Error::from(ErrorKind::UnexpectedEof)),
	};
	stream.set_position(end as u64);
	Ok(&stream.get_ref()[start..end])
}
