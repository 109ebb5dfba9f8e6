use std::fmt::{Debug, Formatter};
use std::io::{Cursor, ErrorKind};

use crate::utilities::FromByteStream;

macro_rules! define_metadata_token {
	($($id: ident = $discriminant: literal),*) => {
		/// Table identifier encoded in the top byte of a metadata token.
		#[repr(u32)]
		#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
		pub enum MetadataTokenKind {
			$($id = $discriminant),*
		}

		/// A coded reference into the owning module's metadata.
		///
		/// IL inline operands only ever carry the token kinds listed here;
		/// resolution to an actual type, method or field is the type system
		/// oracle's job.
		#[derive(Copy, Clone, Eq, PartialEq, Hash)]
		pub struct MetadataToken(u32);

		impl MetadataToken {
			pub fn kind(&self) -> MetadataTokenKind {
				let discriminant = (self.0 & 0xFF000000) >> 24;
				match discriminant {
					$($discriminant => MetadataTokenKind::$id,)*
					_ => unreachable!(),
				}
			}

			pub fn index(&self) -> usize {
				(self.0 & 0x00FFFFFF) as usize
			}

			pub fn raw(&self) -> u32 {
				self.0
			}

			pub fn is_nil(&self) -> bool {
				self.index() == 0
			}
		}

		impl FromByteStream for MetadataToken {
			#[inline]
			fn read(stream: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
				let value = u32::read(stream)?;
				MetadataToken::try_from(value).map_err(|_| ErrorKind::InvalidData.into())
			}
		}

		impl TryFrom<u32> for MetadataToken {
			type Error = ();
			#[inline(never)]
			fn try_from(value: u32) -> Result<Self, Self::Error> {
				let discriminant = (value & 0xFF000000) >> 24;
				match discriminant {
					$($discriminant => Ok(Self(value)),)*
					_ => Err(())
				}
			}
		}
	};
}

define_metadata_token! {
	TypeRef = 0x01,
	TypeDef = 0x02,
	Field = 0x04,
	Method = 0x06,
	MemberRef = 0x0a,
	Signature = 0x11,
	TypeSpec = 0x1b,
	MethodSpec = 0x2b,
	String = 0x70
}

impl MetadataToken {
	/// Does this token name a type (definition, reference or instantiation)?
	pub fn is_type(&self) -> bool {
		matches!(
			self.kind(),
			MetadataTokenKind::TypeDef | MetadataTokenKind::TypeRef | MetadataTokenKind::TypeSpec
		)
	}
}

impl Debug for MetadataToken {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "MetadataToken::{:?}", self.kind())?;
		let mut dbg = f.debug_tuple("");
		dbg.field(&self.index());
		dbg.finish()
	}
}
