use std::io::ErrorKind as IoErrorKind;

use crate::errors::{ErrorArgument, ErrorKind, VerifyError};
use crate::il::{OpCode, OpCodeIterator};
use crate::regions::ExceptionRegion;
use crate::stack::StackSlot;

pub(crate) const NO_BLOCK: u32 = u32::MAX;

/// Import state machine of a basic block. A block is visited at most twice
/// after marking: once to establish its entry stack, and again only when an
/// incoming merge strictly widens it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ImportState {
	Unmarked,
	Pending,
	WasImported,
	ErrorOrVerified,
}

/// A basic block pinned to its starting IL offset. The entry stack lives in
/// the per-verification arena and is frozen on first arrival; `next_on_worklist`
/// is the intrusive link of the pending list.
#[derive(Debug)]
pub(crate) struct BasicBlock<'l, Ty, M> {
	pub offset: u32,
	pub state: ImportState,
	pub entry_stack: &'l [StackSlot<Ty, M>],
	pub try_start: bool,
	pub filter_start: bool,
	pub handler_start: bool,
	next_on_worklist: u32,
}

/// The control-flow graph: a dense offset-indexed map into a block arena,
/// plus the worklist head. Successor links are offsets, not pointers.
#[derive(Debug)]
pub(crate) struct BlockGraph<'l, Ty, M> {
	blocks: Vec<BasicBlock<'l, Ty, M>>,
	index_by_offset: Vec<u32>,
	worklist_head: u32,
}

impl<'l, Ty: Copy + Eq, M: Copy + Eq> BlockGraph<'l, Ty, M> {
	fn new(il_len: usize) -> Self {
		Self {
			blocks: Vec::new(),
			index_by_offset: vec![NO_BLOCK; il_len],
			worklist_head: NO_BLOCK,
		}
	}

	pub fn ensure_block(&mut self, offset: u32) -> u32 {
		match self.index_by_offset[offset as usize] {
			NO_BLOCK => {
				let index = self.blocks.len() as u32;
				self.blocks.push(BasicBlock {
					offset,
					state: ImportState::Unmarked,
					entry_stack: &[],
					try_start: false,
					filter_start: false,
					handler_start: false,
					next_on_worklist: NO_BLOCK,
				});
				self.index_by_offset[offset as usize] = index;
				index
			}
			index => index,
		}
	}

	#[inline]
	pub fn index_at(&self, offset: u32) -> Option<u32> {
		match self.index_by_offset.get(offset as usize) {
			Some(&NO_BLOCK) | None => None,
			Some(&index) => Some(index),
		}
	}

	#[inline]
	pub fn block(&self, index: u32) -> &BasicBlock<'l, Ty, M> {
		&self.blocks[index as usize]
	}

	#[inline]
	pub fn block_mut(&mut self, index: u32) -> &mut BasicBlock<'l, Ty, M> {
		&mut self.blocks[index as usize]
	}

	/// Mark pending and push onto the worklist, unless it is already queued.
	pub fn enqueue(&mut self, index: u32) {
		let head = self.worklist_head;
		let block = self.block_mut(index);
		if block.state == ImportState::Pending {
			return;
		}
		block.state = ImportState::Pending;
		block.next_on_worklist = head;
		self.worklist_head = index;
	}

	/// Pop the next pending block, marking it imported.
	pub fn dequeue(&mut self) -> Option<u32> {
		match self.worklist_head {
			NO_BLOCK => None,
			index => {
				let block = self.block_mut(index);
				let next = block.next_on_worklist;
				block.next_on_worklist = NO_BLOCK;
				block.state = ImportState::WasImported;
				self.worklist_head = next;
				Some(index)
			}
		}
	}
}

pub(crate) fn reader_error(offset: u32, error: std::io::Error) -> VerifyError {
	let kind = match error.kind() {
		IoErrorKind::UnexpectedEof => ErrorKind::EndOfMethodInsideInstruction,
		_ => ErrorKind::InvalidOpcode,
	};
	VerifyError::new(kind, offset)
}

fn checked_target(offset: u32, target: i64, il_len: u32) -> Result<u32, VerifyError> {
	match (0..il_len as i64).contains(&target) {
		true => Ok(target as u32),
		false => Err(VerifyError::new(ErrorKind::InvalidBranchTarget, offset)
			.with(ErrorArgument::Offset(target as u32))),
	}
}

/// The single pre-pass over the IL: scan every instruction, create a block at
/// offset 0, at every branch and switch target, and after every conditional
/// branch, then flag the exception-region anchors. Targets outside the method
/// are rejected here; targets inside an instruction are detected later, when
/// the dataflow walks the containing block.
pub(crate) fn discover_blocks<'l, Ty, M, R>(
	il: &[u8],
	regions: &[ExceptionRegion<R>],
) -> Result<BlockGraph<'l, Ty, M>, VerifyError>
where
	Ty: Copy + Eq,
	M: Copy + Eq,
{
	let il_len = il.len() as u32;
	let mut graph = BlockGraph::new(il.len());
	graph.ensure_block(0);

	let mut stream = OpCodeIterator::new(il);
	while let Some((offset, op)) = stream.next() {
		let op = op.map_err(|e| reader_error(offset, e))?;
		let next = stream.offset();
		let conditional = |graph: &mut BlockGraph<'l, Ty, M>, delta: i64| -> Result<(), VerifyError> {
			let target = checked_target(offset, next as i64 + delta, il_len)?;
			graph.ensure_block(target);
			if next < il_len {
				graph.ensure_block(next);
			}
			Ok(())
		};
		match op {
			OpCode::br_s(delta) | OpCode::leave_s(delta) => {
				let target = checked_target(offset, next as i64 + delta as i64, il_len)?;
				graph.ensure_block(target);
			}
			OpCode::br(delta) | OpCode::leave(delta) => {
				let target = checked_target(offset, next as i64 + delta as i64, il_len)?;
				graph.ensure_block(target);
			}
			OpCode::brfalse_s(delta) | OpCode::brtrue_s(delta)
			| OpCode::beq_s(delta) | OpCode::bge_s(delta) | OpCode::bgt_s(delta)
			| OpCode::ble_s(delta) | OpCode::blt_s(delta) | OpCode::bne_un_s(delta)
			| OpCode::bge_un_s(delta) | OpCode::bgt_un_s(delta)
			| OpCode::ble_un_s(delta) | OpCode::blt_un_s(delta) => {
				conditional(&mut graph, delta as i64)?;
			}
			OpCode::brfalse(delta) | OpCode::brtrue(delta)
			| OpCode::beq(delta) | OpCode::bge(delta) | OpCode::bgt(delta)
			| OpCode::ble(delta) | OpCode::blt(delta) | OpCode::bne_un(delta)
			| OpCode::bge_un(delta) | OpCode::bgt_un(delta)
			| OpCode::ble_un(delta) | OpCode::blt_un(delta) => {
				conditional(&mut graph, delta as i64)?;
			}
			OpCode::switch(table) => {
				for target in table.targets(next) {
					let target = checked_target(offset, target, il_len)?;
					graph.ensure_block(target);
				}
				if next < il_len {
					graph.ensure_block(next);
				}
			}
			_ => {}
		}
	}

	for region in regions {
		let index = graph.ensure_block(region.try_offset);
		graph.block_mut(index).try_start = true;
		let index = graph.ensure_block(region.handler_offset);
		graph.block_mut(index).handler_start = true;
		if let Some(filter_offset) = region.filter_offset {
			let index = graph.ensure_block(filter_offset);
			graph.block_mut(index).filter_start = true;
		}
	}

	Ok(graph)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn graph(il: &[u8]) -> BlockGraph<'static, u32, u32> {
		discover_blocks::<u32, u32, u32>(il, &[]).unwrap()
	}

	#[test]
	fn creates_blocks_at_targets_and_fallthroughs() {
		// brtrue.s +1; nop; nop; ret
		let il = [0x2D, 0x01, 0x00, 0x00, 0x2A];
		let graph = graph(&il);
		assert!(graph.index_at(0).is_some());
		assert!(graph.index_at(2).is_some()); // fallthrough
		assert!(graph.index_at(3).is_some()); // target
		assert!(graph.index_at(4).is_none()); // plain continuation
	}

	#[test]
	fn backward_targets_are_blocks() {
		// nop; nop; br.s -4
		let il = [0x00, 0x00, 0x2B, 0xFC];
		let graph = graph(&il);
		assert!(graph.index_at(0).is_some());
		assert!(graph.index_at(3).is_none());
	}

	#[test]
	fn rejects_targets_outside_the_method() {
		// br.s 0x7F in an 8-byte method
		let il = [0x2B, 0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A];
		let error = discover_blocks::<u32, u32, u32>(&il, &[]).unwrap_err();
		assert_eq!(error.kind, ErrorKind::InvalidBranchTarget);
	}

	#[test]
	fn truncated_tail_instruction_is_a_reader_error() {
		let il = [0x00, 0x20, 0x01]; // nop; ldc.i4 <truncated>
		let error = discover_blocks::<u32, u32, u32>(&il, &[]).unwrap_err();
		assert_eq!(error.kind, ErrorKind::EndOfMethodInsideInstruction);
		assert_eq!(error.offset, 1);
	}

	#[test]
	fn worklist_is_lifo_and_tracks_state() {
		let il = [0x2D, 0x01, 0x00, 0x00, 0x2A];
		let mut graph = graph(&il);
		let a = graph.index_at(2).unwrap();
		let b = graph.index_at(3).unwrap();
		graph.enqueue(a);
		graph.enqueue(b);
		graph.enqueue(a); // already pending, no duplicate
		assert_eq!(graph.dequeue(), Some(b));
		assert_eq!(graph.dequeue(), Some(a));
		assert_eq!(graph.block(a).state, ImportState::WasImported);
		assert_eq!(graph.dequeue(), None);
	}
}
