use std::ops::Range;

use crate::errors::{ErrorArgument, ErrorKind, VerifyError};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RegionKind {
	Catch,
	Filter,
	Finally,
	Fault,
}

/// One exception-handling clause of a method body.
///
/// A filter clause owns two handler-side ranges: the filter expression at
/// `[filter_offset, handler_offset)` and the handler proper at
/// `[handler_offset, handler_offset + handler_length)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExceptionRegion<Ty> {
	pub kind: RegionKind,
	pub try_offset: u32,
	pub try_length: u32,
	pub handler_offset: u32,
	pub handler_length: u32,
	pub filter_offset: Option<u32>,
	pub caught_type: Option<Ty>,
}

impl<Ty> ExceptionRegion<Ty> {
	pub fn try_range(&self) -> Range<u32> {
		self.try_offset..self.try_offset + self.try_length
	}

	pub fn handler_range(&self) -> Range<u32> {
		self.handler_offset..self.handler_offset + self.handler_length
	}

	pub fn filter_range(&self) -> Option<Range<u32>> {
		self.filter_offset.map(|start| start..self.handler_offset)
	}

	pub fn try_contains(&self, offset: u32) -> bool {
		self.try_range().contains(&offset)
	}

	pub fn handler_contains(&self, offset: u32) -> bool {
		self.handler_range().contains(&offset)
	}

	pub fn filter_contains(&self, offset: u32) -> bool {
		self.filter_range().is_some_and(|range| range.contains(&offset))
	}

	/// Anywhere exception plumbing constrains control flow: the try, the
	/// handler, or the filter expression.
	pub fn any_contains(&self, offset: u32) -> bool {
		self.try_contains(offset) || self.handler_contains(offset) || self.filter_contains(offset)
	}
}

fn disjoint(a: &Range<u32>, b: &Range<u32>) -> bool {
	a.end <= b.start || b.end <= a.start
}

fn nested(inner: &Range<u32>, outer: &Range<u32>) -> bool {
	outer.start <= inner.start && inner.end <= outer.end
}

fn properly_placed(a: &Range<u32>, b: &Range<u32>) -> bool {
	disjoint(a, b) || nested(a, b) || nested(b, a)
}

fn region_error(index: usize, detail: &'static str) -> VerifyError {
	VerifyError::new(ErrorKind::InvalidExceptionRegion, 0)
		.with(ErrorArgument::Index(index as u32))
		.with(ErrorArgument::Detail(detail))
}

/// Structural validation of all clauses, before any dataflow runs: ranges
/// well-formed and in bounds, try and handler disjoint, clause metadata
/// consistent with its kind, and every pair of ranges across clauses either
/// disjoint or properly nested.
pub fn validate_regions<Ty>(regions: &[ExceptionRegion<Ty>], il_len: u32) -> Result<(), VerifyError> {
	for (i, region) in regions.iter().enumerate() {
		if region.try_length == 0 || region.handler_length == 0 {
			return Err(region_error(i, "empty try or handler range"));
		}
		if region.try_range().end > il_len || region.handler_range().end > il_len {
			return Err(region_error(i, "range extends past the end of the method"));
		}
		match region.kind {
			RegionKind::Filter => {
				let Some(filter) = region.filter_range() else {
					return Err(region_error(i, "filter clause without a filter offset"));
				};
				if filter.is_empty() || filter.end > il_len {
					return Err(region_error(i, "malformed filter expression range"));
				}
				if region.caught_type.is_some() {
					return Err(region_error(i, "filter clause with a catch type"));
				}
				if !disjoint(&region.try_range(), &filter) {
					return Err(region_error(i, "try and filter expression overlap"));
				}
			}
			RegionKind::Catch => {
				if region.caught_type.is_none() {
					return Err(region_error(i, "catch clause without a catch type"));
				}
				if region.filter_offset.is_some() {
					return Err(region_error(i, "catch clause with a filter offset"));
				}
			}
			RegionKind::Finally | RegionKind::Fault => {
				if region.caught_type.is_some() || region.filter_offset.is_some() {
					return Err(region_error(i, "finally or fault clause with catch metadata"));
				}
			}
		}
		if !disjoint(&region.try_range(), &region.handler_range()) {
			return Err(region_error(i, "try and handler overlap"));
		}
	}

	let ranges_of = |region: &ExceptionRegion<Ty>| {
		let mut ranges = vec![region.try_range(), region.handler_range()];
		ranges.extend(region.filter_range());
		ranges
	};

	for (i, a) in regions.iter().enumerate() {
		for b in regions.iter().skip(i + 1) {
			for ra in ranges_of(a) {
				for rb in ranges_of(b) {
					if !properly_placed(&ra, &rb) {
						return Err(region_error(i, "regions neither disjoint nor properly nested"));
					}
				}
			}
		}
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn catch(try_offset: u32, try_length: u32, handler_offset: u32, handler_length: u32) -> ExceptionRegion<u32> {
		ExceptionRegion {
			kind: RegionKind::Catch,
			try_offset,
			try_length,
			handler_offset,
			handler_length,
			filter_offset: None,
			caught_type: Some(0),
		}
	}

	#[test]
	fn accepts_disjoint_and_nested_clauses() {
		let regions = [catch(0, 10, 10, 5), catch(2, 4, 15, 3)];
		assert!(validate_regions(&regions, 32).is_ok());
	}

	#[test]
	fn rejects_overlapping_try_and_handler() {
		let region = catch(0, 10, 5, 5);
		let error = validate_regions(&[region], 32).unwrap_err();
		assert_eq!(error.kind, ErrorKind::InvalidExceptionRegion);
	}

	#[test]
	fn rejects_partially_overlapping_clauses() {
		let regions = [catch(0, 10, 20, 5), catch(5, 10, 25, 5)];
		let error = validate_regions(&regions, 32).unwrap_err();
		assert_eq!(error.kind, ErrorKind::InvalidExceptionRegion);
	}

	#[test]
	fn rejects_out_of_bounds_ranges() {
		let region = catch(0, 10, 10, 30);
		assert!(validate_regions(&[region], 32).is_err());
	}

	#[test]
	fn rejects_catch_without_type() {
		let mut region = catch(0, 4, 4, 4);
		region.caught_type = None;
		assert!(validate_regions(&[region], 16).is_err());
	}

	#[test]
	fn filter_expression_range_ends_at_handler() {
		let region = ExceptionRegion::<u32> {
			kind: RegionKind::Filter,
			try_offset: 0,
			try_length: 4,
			handler_offset: 8,
			handler_length: 4,
			filter_offset: Some(4),
			caught_type: None,
		};
		assert!(validate_regions(&[region], 16).is_ok());
		assert_eq!(region.filter_range(), Some(4..8));
		assert!(region.filter_contains(5));
		assert!(!region.filter_contains(8));
	}
}
