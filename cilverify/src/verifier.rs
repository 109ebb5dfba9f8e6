//! The per-method abstract interpreter: a worklist dataflow over the basic
//! blocks discovered by [`crate::blocks`], tracking a typed evaluation stack
//! through every instruction and reconciling states at merge points with the
//! lattice operations in [`crate::lattice`].

use bitflags::bitflags;
use bumpalo::Bump;
use derivative::Derivative;

use crate::blocks::{discover_blocks, reader_error, BlockGraph, ImportState};
use crate::errors::{ErrorArgument, ErrorKind, ReportPolicy, VerificationFailure, VerifyError};
use crate::il::{ExtendedOpCode, OpCode, OpCodeIterator, SwitchTable};
use crate::lattice::{
	binary_comparable, binary_numeric_result, merge_slots, slot_assignable_to,
	verification_types_match,
};
use crate::metadata_token::{MetadataToken, MetadataTokenKind};
use crate::regions::{validate_regions, ExceptionRegion, RegionKind};
use crate::stack::{SlotFlags, SlotKind, StackSlot};
use crate::typesystem::{BytecodeSource, TypeKind, TypeSystem, WellKnownType};

type Slot<T> = StackSlot<<T as TypeSystem>::Type, <T as TypeSystem>::Method>;

bitflags! {
	/// One-shot flags set by prefix opcodes, consumed or rejected by the next
	/// instruction.
	#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
	struct PrefixFlags: u8 {
		const CONSTRAINED = 0x01;
		const TAIL = 0x02;
		const VOLATILE = 0x04;
		const UNALIGNED = 0x08;
		const READONLY = 0x10;
		const NO_CHECKS = 0x20;
	}
}

/// Knobs of a verification run.
#[derive(Debug, Default, Clone)]
pub struct VerifierOptions {
	pub policy: ReportPolicy,
}

/// How a declared argument is addressed by the `ldarg`/`starg` family.
#[derive(Debug, Copy, Clone)]
enum ArgDecl<Ty> {
	Typed(Ty),
	/// The implicit `this` of a value-type method: a managed pointer to the
	/// declaring type, with no by-ref type behind it in metadata.
	ByRefThis(Ty),
}

enum Flow {
	Next,
	End,
}

/// Verify one method body.
///
/// The outcome is a pure function of the method identity; concurrent calls
/// for the same method are safe and produce the same answer. All state is
/// allocated per call and released on return.
#[cfg_attr(feature = "tracing", tracing::instrument(skip(sys, bytecode, options)))]
pub fn verify<T, B>(
	sys: &T,
	bytecode: &B,
	method: T::Method,
	declaring_type: T::Type,
	options: &VerifierOptions,
) -> Result<(), VerificationFailure>
where
	T: TypeSystem,
	B: BytecodeSource<T>,
{
	let bump = Bump::new();
	let mut errors = Vec::new();
	let outcome = run(sys, bytecode, method, declaring_type, options, &bump, &mut errors);
	match outcome {
		Ok(()) if errors.is_empty() => Ok(()),
		Ok(()) => Err(VerificationFailure { errors }),
		Err(error) => {
			errors.push(error);
			Err(VerificationFailure { errors })
		}
	}
}

fn run<'l, T, B>(
	sys: &'l T,
	bytecode: &'l B,
	method: T::Method,
	declaring_type: T::Type,
	options: &VerifierOptions,
	bump: &'l Bump,
	errors: &mut Vec<VerifyError>,
) -> Result<(), VerifyError>
where
	T: TypeSystem,
	B: BytecodeSource<T>,
{
	let il = bytecode.il_bytes(method);
	if il.is_empty() {
		return Err(VerifyError::new(ErrorKind::FallthroughEndMethod, 0));
	}

	let regions = bytecode.exception_regions(method);
	validate_regions(&regions, il.len() as u32)?;

	let local_types = bytecode.locals(method);
	if !local_types.is_empty() && !bytecode.init_locals(method) {
		let error = VerifyError::new(ErrorKind::InitLocals, 0);
		match options.policy {
			ReportPolicy::FailFast => return Err(error),
			ReportPolicy::CollectAll => errors.push(error),
		}
	}

	let mut arg_decls = Vec::new();
	let mut arg_slots: Vec<Slot<T>> = Vec::new();
	if !sys.method_is_static(method) {
		let (decl, slot) = match sys.kind(declaring_type).is_value() {
			true => (ArgDecl::ByRefThis(declaring_type), StackSlot::byref(declaring_type)),
			false => (ArgDecl::Typed(declaring_type), StackSlot::obj_ref(declaring_type)),
		};
		arg_decls.push(decl);
		arg_slots.push(slot.with_flag(SlotFlags::THIS_PTR));
	}
	for param in sys.method_parameters(method) {
		arg_decls.push(ArgDecl::Typed(param));
		arg_slots.push(StackSlot::of_type(sys, param));
	}

	let local_slots = local_types.iter().map(|&ty| StackSlot::of_type(sys, ty)).collect();
	let graph = discover_blocks(il, &regions)?;

	let mut verifier = MethodVerifier {
		sys,
		bump,
		method,
		declaring_type,
		il,
		arg_decls,
		arg_slots,
		local_types,
		local_slots,
		return_type: sys.method_return_type(method),
		is_vararg: bytecode.is_vararg(method),
		max_stack: bytecode.max_stack(method) as usize,
		regions,
		graph,
		stack: Vec::new(),
		offset: 0,
		prefixes: PrefixFlags::empty(),
		constrained_type: None,
		tail_pending: false,
	};

	verifier.seed_blocks();

	while let Some(index) = verifier.graph.dequeue() {
		#[cfg(feature = "tracing")]
		tracing::debug!(offset = verifier.graph.block(index).offset, "importing basic block");
		if let Err(error) = verifier.import_block(index) {
			match options.policy {
				ReportPolicy::FailFast => return Err(error),
				ReportPolicy::CollectAll => {
					verifier.graph.block_mut(index).state = ImportState::ErrorOrVerified;
					errors.push(error);
				}
			}
		}
	}

	Ok(())
}

#[derive(Derivative)]
#[derivative(Debug)]
struct MethodVerifier<'l, T: TypeSystem> {
	#[derivative(Debug = "ignore")]
	sys: &'l T,
	#[derivative(Debug = "ignore")]
	bump: &'l Bump,
	#[derivative(Debug = "ignore")]
	graph: BlockGraph<'l, T::Type, T::Method>,
	method: T::Method,
	declaring_type: T::Type,
	#[derivative(Debug = "ignore")]
	il: &'l [u8],
	arg_decls: Vec<ArgDecl<T::Type>>,
	arg_slots: Vec<Slot<T>>,
	local_types: Vec<T::Type>,
	local_slots: Vec<Slot<T>>,
	return_type: Option<T::Type>,
	is_vararg: bool,
	max_stack: usize,
	regions: Vec<ExceptionRegion<T::Type>>,
	stack: Vec<Slot<T>>,
	offset: u32,
	prefixes: PrefixFlags,
	constrained_type: Option<T::Type>,
	tail_pending: bool,
}

impl<'l, T: TypeSystem> MethodVerifier<'l, T> {
	fn il_len(&self) -> u32 {
		self.il.len() as u32
	}

	fn error(&self, kind: ErrorKind) -> VerifyError {
		VerifyError::new(kind, self.offset)
	}

	fn found<V: std::fmt::Debug>(&self, kind: ErrorKind, value: &V) -> VerifyError {
		self.error(kind).with(ErrorArgument::Found(format!("{value:?}")))
	}

	fn expected_found<E: std::fmt::Debug, V: std::fmt::Debug>(
		&self,
		kind: ErrorKind,
		expected: &E,
		found: &V,
	) -> VerifyError {
		self.error(kind)
			.with(ErrorArgument::Expected(format!("{expected:?}")))
			.with(ErrorArgument::Found(format!("{found:?}")))
	}

	fn push(&mut self, slot: Slot<T>) -> Result<(), VerifyError> {
		match self.stack.len() < self.max_stack {
			true => {
				self.stack.push(slot);
				Ok(())
			}
			false => Err(self.error(ErrorKind::StackOverflow)),
		}
	}

	fn pop(&mut self) -> Result<Slot<T>, VerifyError> {
		self.stack.pop().ok_or_else(|| self.error(ErrorKind::StackUnderflow))
	}

	fn kind_slot(kind: SlotKind) -> Slot<T> {
		match kind {
			SlotKind::Int32 => StackSlot::int32(),
			SlotKind::Int64 => StackSlot::int64(),
			SlotKind::NativeInt => StackSlot::native_int(),
			SlotKind::Float => StackSlot::float(),
			_ => unreachable!("numeric result kinds only"),
		}
	}

	// ---------------------------------------------------------------- seeding

	/// Seed the fixed entry states: the initial block with an empty stack,
	/// try entries empty, handler entries with their kind-specific stacks.
	/// Seeds are planted regardless of incoming edges.
	fn seed_blocks(&mut self) {
		let exception = self.sys.well_known(WellKnownType::Exception);
		let regions = std::mem::take(&mut self.regions);

		for region in &regions {
			let index = self.graph.index_at(region.try_offset).expect("anchor blocks exist");
			self.seed(index, &[]);
		}
		for region in &regions {
			let handler = self.graph.index_at(region.handler_offset).expect("anchor blocks exist");
			match region.kind {
				RegionKind::Catch => {
					let caught = region.caught_type.expect("validated catch clause");
					self.seed(handler, &[StackSlot::obj_ref(caught)]);
				}
				RegionKind::Filter => {
					let seed = [StackSlot::obj_ref(exception)];
					let filter = region.filter_offset.expect("validated filter clause");
					let filter = self.graph.index_at(filter).expect("anchor blocks exist");
					self.seed(filter, &seed);
					self.seed(handler, &seed);
				}
				RegionKind::Finally | RegionKind::Fault => self.seed(handler, &[]),
			}
		}

		self.regions = regions;

		let entry = self.graph.index_at(0).expect("block zero always exists");
		if self.graph.block(entry).state == ImportState::Unmarked {
			self.seed(entry, &[]);
		}
	}

	fn seed(&mut self, index: u32, stack: &[Slot<T>]) {
		let entry: &'l [Slot<T>] = self.bump.alloc_slice_copy(stack);
		self.graph.block_mut(index).entry_stack = entry;
		self.graph.enqueue(index);
	}

	// ------------------------------------------------------------- the driver

	fn import_block(&mut self, index: u32) -> Result<(), VerifyError> {
		let block = self.graph.block(index);
		let start = block.offset;
		let entry = block.entry_stack;
		self.stack.clear();
		self.stack.extend_from_slice(entry);
		self.prefixes = PrefixFlags::empty();
		self.constrained_type = None;
		self.tail_pending = false;

		let mut stream = OpCodeIterator::starting_at(self.il, start);
		loop {
			let Some((offset, op)) = stream.next() else {
				return Err(VerifyError::new(ErrorKind::FallthroughEndMethod, self.offset));
			};
			self.offset = offset;
			let op = op.map_err(|error| reader_error(offset, error))?;
			let next = stream.offset();

			// a block boundary inside this instruction means some branch
			// targets the middle of it
			for mid in offset + 1..next {
				if self.graph.index_at(mid).is_some() {
					return Err(self.error(ErrorKind::InvalidBranchTarget).with(ErrorArgument::Offset(mid)));
				}
			}

			match self.dispatch(op, next)? {
				Flow::End => return Ok(()),
				Flow::Next => {
					if next == self.il_len() {
						return Err(VerifyError::new(ErrorKind::FallthroughEndMethod, offset));
					}
					let Some(successor) = self.graph.index_at(next) else { continue };
					// falling through into the next block
					if !self.prefixes.is_empty() {
						return Err(self
							.error(ErrorKind::InvalidPrefix)
							.with(ErrorArgument::Detail("prefix separated from its instruction")));
					}
					if self.tail_pending {
						return Err(self.error(ErrorKind::TailCallNotFollowedByRet));
					}
					let block = self.graph.block(successor);
					if block.handler_start || block.filter_start {
						return Err(self.error(ErrorKind::FallthroughException));
					}
					let stack = std::mem::take(&mut self.stack);
					self.propagate_stack(next, &stack)?;
					return Ok(());
				}
			}
		}
	}

	/// Merge the given stack into the entry state of the block at `target`,
	/// queueing it when this is the first arrival or when the merge widens
	/// the recorded state.
	fn propagate_stack(&mut self, target: u32, stack: &[Slot<T>]) -> Result<(), VerifyError> {
		let index = self.graph.index_at(target).expect("all propagation targets have blocks");
		let block = self.graph.block(index);
		let state = block.state;
		let entry = block.entry_stack;

		if state == ImportState::Unmarked {
			let entry: &'l [Slot<T>] = self.bump.alloc_slice_copy(stack);
			self.graph.block_mut(index).entry_stack = entry;
			self.graph.enqueue(index);
			return Ok(());
		}

		if entry.len() != stack.len() {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Detail("stack height differs between paths"))
				.with(ErrorArgument::Offset(target)));
		}

		let mut widened = false;
		let mut merged = Vec::with_capacity(entry.len());
		for (recorded, incoming) in entry.iter().zip(stack) {
			let Some(slot) = merge_slots(self.sys, recorded, incoming) else {
				return Err(self.expected_found(ErrorKind::StackUnexpected, recorded, incoming));
			};
			widened |= slot != *recorded;
			merged.push(slot);
		}

		if widened && state != ImportState::ErrorOrVerified {
			let entry: &'l [Slot<T>] = self.bump.alloc_slice_copy(&merged);
			self.graph.block_mut(index).entry_stack = entry;
			self.graph.enqueue(index);
		}

		Ok(())
	}

	// ----------------------------------------------------------- region rules

	fn check_branch_regions(&self, from: u32, to: u32) -> Result<(), VerifyError> {
		for region in &self.regions {
			match (region.try_contains(from), region.try_contains(to)) {
				(false, true) => return Err(self.error(ErrorKind::BranchIntoTry).with(ErrorArgument::Offset(to))),
				(true, false) => return Err(self.error(ErrorKind::BranchOutOfTry).with(ErrorArgument::Offset(to))),
				_ => {}
			}
			match (region.handler_contains(from), region.handler_contains(to)) {
				(false, true) => {
					return Err(self.error(ErrorKind::BranchIntoHandler).with(ErrorArgument::Offset(to)))
				}
				(true, false) => {
					return Err(self.error(ErrorKind::BranchOutOfHandler).with(ErrorArgument::Offset(to)))
				}
				_ => {}
			}
			match (region.filter_contains(from), region.filter_contains(to)) {
				(false, true) => {
					return Err(self.error(ErrorKind::BranchIntoHandler).with(ErrorArgument::Offset(to)))
				}
				(true, false) => {
					return Err(self.error(ErrorKind::BranchOutOfHandler).with(ErrorArgument::Offset(to)))
				}
				_ => {}
			}
		}
		Ok(())
	}

	fn in_any_region(&self, offset: u32) -> bool {
		self.regions.iter().any(|region| region.any_contains(offset))
	}

	// ---------------------------------------------------------------- dispatch

	fn dispatch(&mut self, op: OpCode, next: u32) -> Result<Flow, VerifyError> {
		// a tail. call must be immediately followed by ret
		if self.tail_pending && !matches!(op, OpCode::ret) {
			return Err(self.error(ErrorKind::TailCallNotFollowedByRet));
		}

		if let OpCode::extended(ext) = op {
			match ext {
				ExtendedOpCode::unaligned(alignment) => {
					if !matches!(alignment, 1 | 2 | 4) {
						return Err(self
							.error(ErrorKind::InvalidPrefix)
							.with(ErrorArgument::Detail("unaligned. alignment must be 1, 2 or 4")));
					}
					return self.add_prefix(PrefixFlags::UNALIGNED);
				}
				ExtendedOpCode::volatile => return self.add_prefix(PrefixFlags::VOLATILE),
				ExtendedOpCode::tail => return self.add_prefix(PrefixFlags::TAIL),
				ExtendedOpCode::readonly => return self.add_prefix(PrefixFlags::READONLY),
				ExtendedOpCode::no_chk(_) => return self.add_prefix(PrefixFlags::NO_CHECKS),
				ExtendedOpCode::constrained(token) => {
					let ty = self.resolve_type(token)?;
					self.constrained_type = Some(ty);
					return self.add_prefix(PrefixFlags::CONSTRAINED);
				}
				_ => {}
			}
		}

		let pending = self.prefixes;
		self.prefixes = PrefixFlags::empty();
		let constrained = self.constrained_type.take();
		if !(pending - allowed_prefixes(&op)).is_empty() {
			return Err(self
				.error(ErrorKind::InvalidPrefix)
				.with(ErrorArgument::Detail("prefix not valid for this instruction")));
		}

		match op {
			OpCode::nop | OpCode::dbg_break => Ok(Flow::Next),

			OpCode::ldarg_0 => self.load_arg(0),
			OpCode::ldarg_1 => self.load_arg(1),
			OpCode::ldarg_2 => self.load_arg(2),
			OpCode::ldarg_3 => self.load_arg(3),
			OpCode::ldarg_s(index) => self.load_arg(index as usize),
			OpCode::ldarga_s(index) => self.arg_address(index as usize),
			OpCode::starg_s(index) => self.store_arg(index as usize),
			OpCode::ldloc_0 => self.load_local(0),
			OpCode::ldloc_1 => self.load_local(1),
			OpCode::ldloc_2 => self.load_local(2),
			OpCode::ldloc_3 => self.load_local(3),
			OpCode::ldloc_s(index) => self.load_local(index as usize),
			OpCode::ldloca_s(index) => self.local_address(index as usize),
			OpCode::stloc_0 => self.store_local(0),
			OpCode::stloc_1 => self.store_local(1),
			OpCode::stloc_2 => self.store_local(2),
			OpCode::stloc_3 => self.store_local(3),
			OpCode::stloc_s(index) => self.store_local(index as usize),

			OpCode::ldnull => self.push_flow(StackSlot::null_ref()),
			OpCode::ldc_i4_m1
			| OpCode::ldc_i4_0 | OpCode::ldc_i4_1 | OpCode::ldc_i4_2 | OpCode::ldc_i4_3
			| OpCode::ldc_i4_4 | OpCode::ldc_i4_5 | OpCode::ldc_i4_6 | OpCode::ldc_i4_7
			| OpCode::ldc_i4_8 | OpCode::ldc_i4_s(_) | OpCode::ldc_i4(_) => {
				self.push_flow(StackSlot::int32())
			}
			OpCode::ldc_i8(_) => self.push_flow(StackSlot::int64()),
			OpCode::ldc_r4(_) | OpCode::ldc_r8(_) => self.push_flow(StackSlot::float()),

			OpCode::dup => {
				let slot = self.pop()?;
				self.push(slot)?;
				self.push_flow(slot)
			}
			OpCode::pop => {
				self.pop()?;
				Ok(Flow::Next)
			}

			OpCode::jmp(_) | OpCode::calli(_) => Err(self.error(ErrorKind::Unverifiable)),
			OpCode::call(token) => self.do_call(token, false, pending.contains(PrefixFlags::TAIL), constrained),
			OpCode::callvirt(token) => self.do_call(token, true, pending.contains(PrefixFlags::TAIL), constrained),
			OpCode::newobj(token) => self.do_newobj(token),
			OpCode::ret => self.do_ret(),

			OpCode::br_s(delta) => self.do_branch(next, delta as i64),
			OpCode::br(delta) => self.do_branch(next, delta as i64),
			OpCode::brfalse_s(delta) | OpCode::brtrue_s(delta) => self.do_test_branch(next, delta as i64),
			OpCode::brfalse(delta) | OpCode::brtrue(delta) => self.do_test_branch(next, delta as i64),
			OpCode::beq_s(delta) | OpCode::bne_un_s(delta) => self.do_compare_branch(next, delta as i64, true, true),
			OpCode::beq(delta) | OpCode::bne_un(delta) => self.do_compare_branch(next, delta as i64, true, true),
			OpCode::bge_s(delta) | OpCode::bgt_s(delta) | OpCode::ble_s(delta) | OpCode::blt_s(delta)
			| OpCode::bge_un_s(delta) | OpCode::bgt_un_s(delta)
			| OpCode::ble_un_s(delta) | OpCode::blt_un_s(delta) => {
				self.do_compare_branch(next, delta as i64, false, false)
			}
			OpCode::bge(delta) | OpCode::bgt(delta) | OpCode::ble(delta) | OpCode::blt(delta)
			| OpCode::bge_un(delta) | OpCode::bgt_un(delta)
			| OpCode::ble_un(delta) | OpCode::blt_un(delta) => {
				self.do_compare_branch(next, delta as i64, false, false)
			}
			OpCode::switch(table) => self.do_switch(table, next),
			OpCode::leave_s(delta) => self.do_leave(next, delta as i64),
			OpCode::leave(delta) => self.do_leave(next, delta as i64),

			OpCode::ldind_i1 | OpCode::ldind_u1 => self.do_ldind(WellKnownType::SByte, SlotKind::Int32),
			OpCode::ldind_i2 | OpCode::ldind_u2 => self.do_ldind(WellKnownType::Int16, SlotKind::Int32),
			OpCode::ldind_i4 | OpCode::ldind_u4 => self.do_ldind(WellKnownType::Int32, SlotKind::Int32),
			OpCode::ldind_i8 => self.do_ldind(WellKnownType::Int64, SlotKind::Int64),
			OpCode::ldind_i => self.do_ldind(WellKnownType::IntPtr, SlotKind::NativeInt),
			OpCode::ldind_r4 => self.do_ldind(WellKnownType::Single, SlotKind::Float),
			OpCode::ldind_r8 => self.do_ldind(WellKnownType::Double, SlotKind::Float),
			OpCode::ldind_ref => self.do_ldind_ref(),
			OpCode::stind_i1 => self.do_stind(WellKnownType::SByte, SlotKind::Int32),
			OpCode::stind_i2 => self.do_stind(WellKnownType::Int16, SlotKind::Int32),
			OpCode::stind_i4 => self.do_stind(WellKnownType::Int32, SlotKind::Int32),
			OpCode::stind_i8 => self.do_stind(WellKnownType::Int64, SlotKind::Int64),
			OpCode::stind_i => self.do_stind(WellKnownType::IntPtr, SlotKind::NativeInt),
			OpCode::stind_r4 => self.do_stind(WellKnownType::Single, SlotKind::Float),
			OpCode::stind_r8 => self.do_stind(WellKnownType::Double, SlotKind::Float),
			OpCode::stind_ref => self.do_stind_ref(),

			OpCode::add | OpCode::sub | OpCode::mul | OpCode::div | OpCode::rem => self.binary_arith(true),
			OpCode::div_un | OpCode::rem_un | OpCode::and | OpCode::or | OpCode::xor => self.binary_arith(false),
			OpCode::add_ovf | OpCode::add_ovf_un | OpCode::mul_ovf | OpCode::mul_ovf_un
			| OpCode::sub_ovf | OpCode::sub_ovf_un => self.binary_arith(false),
			OpCode::shl | OpCode::shr | OpCode::shr_un => self.do_shift(),
			OpCode::neg => self.do_unary(true),
			OpCode::not => self.do_unary(false),

			OpCode::conv_i1 | OpCode::conv_i2 | OpCode::conv_i4
			| OpCode::conv_u1 | OpCode::conv_u2 | OpCode::conv_u4
			| OpCode::conv_ovf_i1 | OpCode::conv_ovf_i2 | OpCode::conv_ovf_i4
			| OpCode::conv_ovf_u1 | OpCode::conv_ovf_u2 | OpCode::conv_ovf_u4
			| OpCode::conv_ovf_i1_un | OpCode::conv_ovf_i2_un | OpCode::conv_ovf_i4_un
			| OpCode::conv_ovf_u1_un | OpCode::conv_ovf_u2_un | OpCode::conv_ovf_u4_un => {
				self.do_convert(SlotKind::Int32)
			}
			OpCode::conv_i8 | OpCode::conv_u8 | OpCode::conv_ovf_i8 | OpCode::conv_ovf_u8
			| OpCode::conv_ovf_i8_un | OpCode::conv_ovf_u8_un => self.do_convert(SlotKind::Int64),
			OpCode::conv_i | OpCode::conv_u | OpCode::conv_ovf_i | OpCode::conv_ovf_u
			| OpCode::conv_ovf_i_un | OpCode::conv_ovf_u_un => self.do_convert(SlotKind::NativeInt),
			OpCode::conv_r4 | OpCode::conv_r8 | OpCode::conv_r_un => self.do_convert(SlotKind::Float),
			OpCode::ckfinite => {
				let slot = self.pop()?;
				if slot.kind() != SlotKind::Float {
					return Err(self.found(ErrorKind::ExpectedNumericType, &slot));
				}
				self.push_flow(slot)
			}

			OpCode::cpobj(token) => self.do_cpobj(token),
			OpCode::ldobj(token) => self.do_ldobj(token),
			OpCode::stobj(token) => self.do_stobj(token),
			OpCode::ldstr(token) => {
				if token.kind() != MetadataTokenKind::String {
					return Err(self.error(ErrorKind::TokenResolution).with(ErrorArgument::Token(token)));
				}
				self.push_flow(StackSlot::obj_ref(self.sys.well_known(WellKnownType::String)))
			}
			OpCode::castclass(token) | OpCode::isinst(token) => {
				let ty = self.resolve_type(token)?;
				let slot = self.pop()?;
				if slot.kind() != SlotKind::ObjRef {
					return Err(self.found(ErrorKind::ExpectedObjRef, &slot));
				}
				self.push_flow(StackSlot::obj_ref(ty))
			}
			OpCode::box_val(token) => {
				let ty = self.resolve_type(token)?;
				let slot = self.pop()?;
				if !slot_assignable_to(self.sys, &slot, ty, false) {
					return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &slot));
				}
				self.push_flow(StackSlot::obj_ref(ty))
			}
			OpCode::unbox(token) => {
				let ty = self.resolve_type(token)?;
				if !self.sys.kind(ty).is_value() && self.sys.kind(ty) != TypeKind::GenericParameter {
					return Err(self.error(ErrorKind::ExpectedValueType).with(ErrorArgument::Token(token)));
				}
				let slot = self.pop()?;
				if slot.kind() != SlotKind::ObjRef {
					return Err(self.found(ErrorKind::ExpectedObjRef, &slot));
				}
				let result = StackSlot::byref(ty)
					.with_flag(SlotFlags::PERMANENT_HOME | SlotFlags::READ_ONLY);
				self.push_flow(result)
			}
			OpCode::unbox_any(token) => {
				let ty = self.resolve_type(token)?;
				let slot = self.pop()?;
				if slot.kind() != SlotKind::ObjRef {
					return Err(self.found(ErrorKind::ExpectedObjRef, &slot));
				}
				self.push_flow(StackSlot::of_type(self.sys, ty))
			}

			OpCode::throw => {
				let slot = self.pop()?;
				if slot.kind() != SlotKind::ObjRef {
					return Err(self.found(ErrorKind::ExpectedObjRef, &slot));
				}
				Ok(Flow::End)
			}

			OpCode::ldfld(token) => self.do_ldfld(token, false),
			OpCode::ldflda(token) => self.do_ldfld(token, true),
			OpCode::stfld(token) => self.do_stfld(token),
			OpCode::ldsfld(token) => self.do_ldsfld(token, false),
			OpCode::ldsflda(token) => self.do_ldsfld(token, true),
			OpCode::stsfld(token) => self.do_stsfld(token),

			OpCode::newarr(token) => {
				let element = self.resolve_type(token)?;
				let length = self.pop()?;
				if !matches!(length.kind(), SlotKind::Int32 | SlotKind::NativeInt) {
					return Err(self.found(ErrorKind::ExpectedIntegerType, &length));
				}
				self.push_flow(StackSlot::obj_ref(self.sys.sz_array_of(element)))
			}
			OpCode::ldlen => {
				let array = self.pop()?;
				self.expect_array(&array)?;
				self.push_flow(StackSlot::native_int())
			}
			OpCode::ldelema(token) => self.do_ldelema(token, pending.contains(PrefixFlags::READONLY)),
			OpCode::ldelem_i1 | OpCode::ldelem_u1 => self.do_ldelem(Some(WellKnownType::SByte), SlotKind::Int32),
			OpCode::ldelem_i2 | OpCode::ldelem_u2 => self.do_ldelem(Some(WellKnownType::Int16), SlotKind::Int32),
			OpCode::ldelem_i4 | OpCode::ldelem_u4 => self.do_ldelem(Some(WellKnownType::Int32), SlotKind::Int32),
			OpCode::ldelem_i8 => self.do_ldelem(Some(WellKnownType::Int64), SlotKind::Int64),
			OpCode::ldelem_i => self.do_ldelem(Some(WellKnownType::IntPtr), SlotKind::NativeInt),
			OpCode::ldelem_r4 => self.do_ldelem(Some(WellKnownType::Single), SlotKind::Float),
			OpCode::ldelem_r8 => self.do_ldelem(Some(WellKnownType::Double), SlotKind::Float),
			OpCode::ldelem_ref => self.do_ldelem(None, SlotKind::ObjRef),
			OpCode::ldelem(token) => self.do_ldelem_token(token),
			OpCode::stelem_i1 => self.do_stelem(Some(WellKnownType::SByte), SlotKind::Int32),
			OpCode::stelem_i2 => self.do_stelem(Some(WellKnownType::Int16), SlotKind::Int32),
			OpCode::stelem_i4 => self.do_stelem(Some(WellKnownType::Int32), SlotKind::Int32),
			OpCode::stelem_i8 => self.do_stelem(Some(WellKnownType::Int64), SlotKind::Int64),
			OpCode::stelem_i => self.do_stelem(Some(WellKnownType::IntPtr), SlotKind::NativeInt),
			OpCode::stelem_r4 => self.do_stelem(Some(WellKnownType::Single), SlotKind::Float),
			OpCode::stelem_r8 => self.do_stelem(Some(WellKnownType::Double), SlotKind::Float),
			OpCode::stelem_ref => self.do_stelem(None, SlotKind::ObjRef),
			OpCode::stelem(token) => self.do_stelem_token(token),

			OpCode::refanyval(token) => {
				let ty = self.resolve_type(token)?;
				self.pop_typed_reference()?;
				self.push_flow(StackSlot::byref(ty).with_flag(SlotFlags::PERMANENT_HOME))
			}
			OpCode::mkrefany(token) => {
				let ty = self.resolve_type(token)?;
				let address = self.pop_address(true)?;
				let element = address.type_identity().expect("by-ref slot always has an element");
				if !verification_types_match(self.sys, element, ty) {
					return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &address));
				}
				self.push_flow(StackSlot::value_type(self.sys.well_known(WellKnownType::TypedReference)))
			}
			OpCode::ldtoken(token) => self.do_ldtoken(token),

			OpCode::endfinally => {
				let inside = self.regions.iter().any(|region| {
					matches!(region.kind, RegionKind::Finally | RegionKind::Fault)
						&& region.handler_contains(self.offset)
				});
				if !inside {
					return Err(self.error(ErrorKind::EndFinally));
				}
				self.stack.clear();
				Ok(Flow::End)
			}

			OpCode::extended(ext) => self.dispatch_extended(ext, next),
		}
	}

	fn dispatch_extended(&mut self, op: ExtendedOpCode, next: u32) -> Result<Flow, VerifyError> {
		match op {
			ExtendedOpCode::arglist => {
				if !self.is_vararg {
					return Err(self
						.error(ErrorKind::Unverifiable)
						.with(ErrorArgument::Detail("arglist outside a vararg method")));
				}
				self.push_flow(StackSlot::value_type(
					self.sys.well_known(WellKnownType::RuntimeArgumentHandle),
				))
			}
			ExtendedOpCode::ceq => self.do_compare(true, true),
			ExtendedOpCode::cgt_un => self.do_compare(false, true),
			ExtendedOpCode::cgt | ExtendedOpCode::clt | ExtendedOpCode::clt_un => self.do_compare(false, false),
			ExtendedOpCode::ldftn(token) => {
				let target = self.resolve_method(token)?;
				self.push_flow(StackSlot::method_pointer(target))
			}
			ExtendedOpCode::ldvirtftn(token) => {
				let target = self.resolve_method(token)?;
				let object = self.pop()?;
				if object.kind() != SlotKind::ObjRef {
					return Err(self.found(ErrorKind::ExpectedObjRef, &object));
				}
				let declaring = self.sys.method_declaring_type(target);
				if let Some(ty) = object.type_identity() {
					if !self.sys.is_assignable_to(ty, declaring) {
						return Err(self.expected_found(ErrorKind::StackUnexpected, &declaring, &object));
					}
				}
				self.push_flow(StackSlot::method_pointer(target))
			}
			ExtendedOpCode::ldarg(index) => self.load_arg(index as usize),
			ExtendedOpCode::ldarga(index) => self.arg_address(index as usize),
			ExtendedOpCode::starg(index) => self.store_arg(index as usize),
			ExtendedOpCode::ldloc(index) => self.load_local(index as usize),
			ExtendedOpCode::ldloca(index) => self.local_address(index as usize),
			ExtendedOpCode::stloc(index) => self.store_local(index as usize),
			ExtendedOpCode::localloc => {
				if self.in_any_region(self.offset) {
					return Err(self.error(ErrorKind::LocallocInProtectedRegion));
				}
				let size = self.pop()?;
				if !matches!(size.kind(), SlotKind::Int32 | SlotKind::NativeInt) {
					return Err(self.found(ErrorKind::ExpectedIntegerType, &size));
				}
				if !self.stack.is_empty() {
					return Err(self.error(ErrorKind::UninitStack));
				}
				self.push_flow(StackSlot::native_int())
			}
			ExtendedOpCode::endfilter => self.do_endfilter(next),
			ExtendedOpCode::initobj(token) => {
				let ty = self.resolve_type(token)?;
				let address = self.pop_address(true)?;
				let element = address.type_identity().expect("by-ref slot always has an element");
				if !verification_types_match(self.sys, element, ty) {
					return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &address));
				}
				Ok(Flow::Next)
			}
			ExtendedOpCode::cpblk | ExtendedOpCode::initblk => Err(self.error(ErrorKind::Unverifiable)),
			ExtendedOpCode::rethrow => {
				let inside = self.regions.iter().any(|region| {
					matches!(region.kind, RegionKind::Catch | RegionKind::Filter)
						&& region.handler_contains(self.offset)
				});
				if !inside {
					return Err(self.error(ErrorKind::Rethrow));
				}
				Ok(Flow::End)
			}
			ExtendedOpCode::sizeof(token) => {
				self.resolve_type(token)?;
				self.push_flow(StackSlot::int32())
			}
			ExtendedOpCode::refanytype => {
				self.pop_typed_reference()?;
				self.push_flow(StackSlot::value_type(self.sys.well_known(WellKnownType::RuntimeTypeHandle)))
			}
			// prefixes were handled before dispatch
			ExtendedOpCode::unaligned(_) | ExtendedOpCode::volatile | ExtendedOpCode::tail
			| ExtendedOpCode::constrained(_) | ExtendedOpCode::readonly | ExtendedOpCode::no_chk(_) => {
				unreachable!("prefix opcodes never reach dispatch")
			}
		}
	}

	fn push_flow(&mut self, slot: Slot<T>) -> Result<Flow, VerifyError> {
		self.push(slot)?;
		Ok(Flow::Next)
	}

	fn add_prefix(&mut self, flag: PrefixFlags) -> Result<Flow, VerifyError> {
		match self.prefixes.contains(flag) {
			true => Err(self.error(ErrorKind::PrefixConsecutive)),
			false => {
				self.prefixes |= flag;
				Ok(Flow::Next)
			}
		}
	}

	// ------------------------------------------------------- token resolution

	fn resolve_type(&self, token: MetadataToken) -> Result<T::Type, VerifyError> {
		self.sys
			.resolve_type(token, self.method)
			.ok_or_else(|| self.error(ErrorKind::TokenResolution).with(ErrorArgument::Token(token)))
	}

	fn resolve_method(&self, token: MetadataToken) -> Result<T::Method, VerifyError> {
		self.sys
			.resolve_method(token, self.method)
			.ok_or_else(|| self.error(ErrorKind::TokenResolution).with(ErrorArgument::Token(token)))
	}

	fn resolve_field(&self, token: MetadataToken) -> Result<T::Field, VerifyError> {
		self.sys
			.resolve_field(token, self.method)
			.ok_or_else(|| self.error(ErrorKind::TokenResolution).with(ErrorArgument::Token(token)))
	}

	// --------------------------------------------------- arguments and locals

	fn load_arg(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let slot = *self
			.arg_slots
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownArgument).with(ErrorArgument::Index(index as u32)))?;
		self.push_flow(slot)
	}

	fn arg_address(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let decl = *self
			.arg_decls
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownArgument).with(ErrorArgument::Index(index as u32)))?;
		match decl {
			ArgDecl::Typed(ty) if self.sys.kind(ty) != TypeKind::ByRef => {
				self.push_flow(StackSlot::byref(ty).with_flag(SlotFlags::PERMANENT_HOME))
			}
			_ => Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Detail("cannot take the address of a by-ref argument"))),
		}
	}

	fn store_arg(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let decl = *self
			.arg_decls
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownArgument).with(ErrorArgument::Index(index as u32)))?;
		let slot = self.pop()?;
		let compatible = match decl {
			ArgDecl::Typed(ty) => slot_assignable_to(self.sys, &slot, ty, false),
			ArgDecl::ByRefThis(ty) => {
				slot.kind() == SlotKind::ByRef && slot.type_identity() == Some(ty) && !slot.is_read_only()
			}
		};
		match compatible {
			true => Ok(Flow::Next),
			false => Err(self.found(ErrorKind::StackUnexpected, &slot)),
		}
	}

	fn load_local(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let slot = *self
			.local_slots
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownLocal).with(ErrorArgument::Index(index as u32)))?;
		self.push_flow(slot)
	}

	fn local_address(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let ty = *self
			.local_types
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownLocal).with(ErrorArgument::Index(index as u32)))?;
		if self.sys.kind(ty) == TypeKind::ByRef {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Detail("cannot take the address of a by-ref local")));
		}
		self.push_flow(StackSlot::byref(ty).with_flag(SlotFlags::PERMANENT_HOME))
	}

	fn store_local(&mut self, index: usize) -> Result<Flow, VerifyError> {
		let ty = *self
			.local_types
			.get(index)
			.ok_or_else(|| self.error(ErrorKind::UnknownLocal).with(ErrorArgument::Index(index as u32)))?;
		let slot = self.pop()?;
		match slot_assignable_to(self.sys, &slot, ty, false) {
			true => Ok(Flow::Next),
			false => Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &slot)),
		}
	}

	// -------------------------------------------------------------- arithmetic

	fn binary_arith(&mut self, allow_float: bool) -> Result<Flow, VerifyError> {
		let b = self.pop()?;
		let a = self.pop()?;
		match binary_numeric_result(a.kind(), b.kind(), allow_float) {
			Some(kind) => self.push_flow(Self::kind_slot(kind)),
			None => Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Found(format!("{a:?}")))
				.with(ErrorArgument::Found(format!("{b:?}")))),
		}
	}

	fn do_shift(&mut self) -> Result<Flow, VerifyError> {
		let count = self.pop()?;
		if !matches!(count.kind(), SlotKind::Int32 | SlotKind::NativeInt) {
			return Err(self.found(ErrorKind::ExpectedIntegerType, &count));
		}
		let value = self.pop()?;
		if !matches!(value.kind(), SlotKind::Int32 | SlotKind::Int64 | SlotKind::NativeInt) {
			return Err(self.found(ErrorKind::ExpectedIntegerType, &value));
		}
		self.push_flow(Self::kind_slot(value.kind()))
	}

	fn do_unary(&mut self, allow_float: bool) -> Result<Flow, VerifyError> {
		let slot = self.pop()?;
		let ok = match slot.kind() {
			SlotKind::Int32 | SlotKind::Int64 | SlotKind::NativeInt => true,
			SlotKind::Float => allow_float,
			_ => false,
		};
		match ok {
			true => self.push_flow(Self::kind_slot(slot.kind())),
			false => Err(self.found(
				match allow_float {
					true => ErrorKind::ExpectedNumericType,
					false => ErrorKind::ExpectedIntegerType,
				},
				&slot,
			)),
		}
	}

	fn do_convert(&mut self, target: SlotKind) -> Result<Flow, VerifyError> {
		let slot = self.pop()?;
		match slot.kind() {
			SlotKind::Int32 | SlotKind::Int64 | SlotKind::NativeInt | SlotKind::Float => {
				self.push_flow(Self::kind_slot(target))
			}
			_ => Err(self.found(ErrorKind::ExpectedNumericType, &slot)),
		}
	}

	// ------------------------------------------------------------- comparison

	fn do_compare(&mut self, equality: bool, objref_ok: bool) -> Result<Flow, VerifyError> {
		let b = self.pop()?;
		let a = self.pop()?;
		if !binary_comparable(self.sys, &a, &b, equality, objref_ok) {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Found(format!("{a:?}")))
				.with(ErrorArgument::Found(format!("{b:?}"))));
		}
		self.push_flow(StackSlot::int32())
	}

	// ---------------------------------------------------------------- branches

	fn branch_to(&mut self, next: u32, delta: i64) -> Result<u32, VerifyError> {
		// the discovery pass already bounds-checked every target
		let target = (next as i64 + delta) as u32;
		self.check_branch_regions(self.offset, target)?;
		let stack = self.stack.clone();
		self.propagate_stack(target, &stack)?;
		Ok(target)
	}

	fn do_branch(&mut self, next: u32, delta: i64) -> Result<Flow, VerifyError> {
		self.branch_to(next, delta)?;
		Ok(Flow::End)
	}

	fn do_test_branch(&mut self, next: u32, delta: i64) -> Result<Flow, VerifyError> {
		let slot = self.pop()?;
		if !matches!(
			slot.kind(),
			SlotKind::Int32 | SlotKind::Int64 | SlotKind::NativeInt | SlotKind::ObjRef | SlotKind::ByRef
		) {
			return Err(self.found(ErrorKind::StackUnexpected, &slot));
		}
		self.branch_to(next, delta)?;
		Ok(Flow::Next)
	}

	fn do_compare_branch(
		&mut self,
		next: u32,
		delta: i64,
		equality: bool,
		objref_ok: bool,
	) -> Result<Flow, VerifyError> {
		let b = self.pop()?;
		let a = self.pop()?;
		if !binary_comparable(self.sys, &a, &b, equality, objref_ok) {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Found(format!("{a:?}")))
				.with(ErrorArgument::Found(format!("{b:?}"))));
		}
		self.branch_to(next, delta)?;
		Ok(Flow::Next)
	}

	fn do_switch(&mut self, table: SwitchTable, next: u32) -> Result<Flow, VerifyError> {
		let selector = self.pop()?;
		if selector.kind() != SlotKind::Int32 {
			return Err(self.found(ErrorKind::ExpectedIntegerType, &selector));
		}
		let stack = self.stack.clone();
		for target in table.targets(next) {
			let target = target as u32;
			self.check_branch_regions(self.offset, target)?;
			self.propagate_stack(target, &stack)?;
		}
		Ok(Flow::Next)
	}

	fn do_leave(&mut self, next: u32, delta: i64) -> Result<Flow, VerifyError> {
		let target = (next as i64 + delta) as u32;
		let offset = self.offset;

		// the innermost protected construct the leave sits in; filters and
		// finally/fault handlers cannot be left at all
		let mut innermost: Option<std::ops::Range<u32>> = None;
		for region in &self.regions {
			if region.filter_contains(offset) {
				return Err(self.error(ErrorKind::Leave).with(ErrorArgument::Detail("leave inside a filter")));
			}
			if region.handler_contains(offset)
				&& matches!(region.kind, RegionKind::Finally | RegionKind::Fault)
			{
				return Err(self
					.error(ErrorKind::Leave)
					.with(ErrorArgument::Detail("leave inside a finally or fault handler")));
			}
			let mut consider = |range: std::ops::Range<u32>| {
				if range.contains(&offset) {
					let replace = match &innermost {
						None => true,
						Some(current) => range.end - range.start < current.end - current.start,
					};
					if replace {
						innermost = Some(range);
					}
				}
			};
			consider(region.try_range());
			if matches!(region.kind, RegionKind::Catch | RegionKind::Filter) {
				consider(region.handler_range());
			}
		}

		let Some(leaving) = innermost else {
			return Err(self
				.error(ErrorKind::Leave)
				.with(ErrorArgument::Detail("leave outside any protected region")));
		};
		if leaving.contains(&target) {
			return Err(self.error(ErrorKind::Leave).with(ErrorArgument::Offset(target)));
		}

		// leave may exit regions, never enter them
		for region in &self.regions {
			if region.try_contains(target) && !region.try_contains(offset) {
				return Err(self.error(ErrorKind::BranchIntoTry).with(ErrorArgument::Offset(target)));
			}
			if region.handler_contains(target) && !region.handler_contains(offset) {
				return Err(self.error(ErrorKind::BranchIntoHandler).with(ErrorArgument::Offset(target)));
			}
			if region.filter_contains(target) {
				return Err(self.error(ErrorKind::BranchIntoHandler).with(ErrorArgument::Offset(target)));
			}
		}

		self.stack.clear();
		self.propagate_stack(target, &[])?;
		Ok(Flow::End)
	}

	fn do_endfilter(&mut self, next: u32) -> Result<Flow, VerifyError> {
		let region = *self
			.regions
			.iter()
			.find(|region| region.kind == RegionKind::Filter && region.filter_contains(self.offset))
			.ok_or_else(|| self.error(ErrorKind::EndFilter))?;
		if next != region.handler_offset {
			return Err(self
				.error(ErrorKind::EndFilter)
				.with(ErrorArgument::Detail("endfilter is not the last instruction of the filter")));
		}
		let decision = self.pop()?;
		if decision.kind() != SlotKind::Int32 {
			return Err(self.found(ErrorKind::ExpectedIntegerType, &decision));
		}
		if !self.stack.is_empty() {
			return Err(self.error(ErrorKind::UninitStack));
		}
		Ok(Flow::End)
	}

	// ---------------------------------------------------------------- returns

	fn do_ret(&mut self) -> Result<Flow, VerifyError> {
		self.tail_pending = false;
		if self.in_any_region(self.offset) {
			return Err(self.error(ErrorKind::ReturnFromProtectedRegion));
		}
		if let Some(return_type) = self.return_type {
			let slot = self.pop()?;
			match self.sys.kind(return_type) {
				TypeKind::ByRef => {
					let element = self.sys.element_type(return_type).expect("by-ref type without an element");
					if slot.kind() != SlotKind::ByRef || slot.type_identity() != Some(element) {
						return Err(self.expected_found(ErrorKind::StackUnexpected, &return_type, &slot));
					}
					if !slot.has_permanent_home() || slot.is_read_only() {
						return Err(self.found(ErrorKind::ReturnPtrToStack, &slot));
					}
				}
				_ => {
					if !slot_assignable_to(self.sys, &slot, return_type, false) {
						return Err(self.expected_found(ErrorKind::StackUnexpected, &return_type, &slot));
					}
				}
			}
		}
		if !self.stack.is_empty() {
			return Err(self.error(ErrorKind::UninitStack));
		}
		Ok(Flow::End)
	}

	// ------------------------------------------------------------------- calls

	fn do_call(
		&mut self,
		token: MetadataToken,
		virtual_call: bool,
		tail: bool,
		constrained: Option<T::Type>,
	) -> Result<Flow, VerifyError> {
		let callee = self.resolve_method(token)?;
		if !self.sys.method_is_accessible(callee, self.declaring_type) {
			return Err(self.error(ErrorKind::MethodAccess).with(ErrorArgument::Token(token)));
		}
		let declaring = self.sys.method_declaring_type(callee);
		let is_static = self.sys.method_is_static(callee);
		if virtual_call && is_static {
			return Err(self
				.error(ErrorKind::ThisMismatch)
				.with(ErrorArgument::Detail("callvirt on a static method")));
		}

		if tail {
			if self.in_any_region(self.offset) {
				return Err(self.error(ErrorKind::TailCallInProtectedRegion));
			}
			let compatible = match (self.sys.method_return_type(callee), self.return_type) {
				(None, None) => true,
				(Some(callee_ret), Some(caller_ret)) => {
					callee_ret == caller_ret || self.sys.is_assignable_to(callee_ret, caller_ret)
				}
				_ => false,
			};
			if !compatible {
				return Err(self.error(ErrorKind::TailCallReturnMismatch));
			}
		}

		let parameters = self.sys.method_parameters(callee);
		for &parameter in parameters.iter().rev() {
			let slot = self.pop()?;
			if !slot_assignable_to(self.sys, &slot, parameter, false) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &parameter, &slot));
			}
		}

		if !is_static {
			let this = self.pop()?;
			self.check_this(&this, declaring, callee, virtual_call, constrained)?;
		}

		if let Some(return_type) = self.sys.method_return_type(callee) {
			let mut slot = StackSlot::of_type(self.sys, return_type);
			if slot.kind() == SlotKind::ByRef {
				// the callee guarantees its by-ref return outlives this frame
				slot = slot.with_flag(SlotFlags::PERMANENT_HOME);
			}
			self.push(slot)?;
		}

		if tail {
			self.tail_pending = true;
		}
		Ok(Flow::Next)
	}

	fn check_this(
		&self,
		this: &Slot<T>,
		declaring: T::Type,
		callee: T::Method,
		virtual_call: bool,
		constrained: Option<T::Type>,
	) -> Result<(), VerifyError> {
		if let Some(receiver) = constrained {
			if this.kind() != SlotKind::ByRef || this.type_identity() != Some(receiver) {
				return Err(self.expected_found(ErrorKind::ThisMismatch, &receiver, this));
			}
			if self.sys.kind(receiver) != TypeKind::GenericParameter
				&& !self.sys.is_assignable_to(receiver, declaring)
			{
				return Err(self.expected_found(ErrorKind::ThisMismatch, &declaring, this));
			}
			return Ok(());
		}

		if self.sys.kind(declaring).is_value() {
			// value-type receivers are managed pointers; callvirt needs the
			// constrained. prefix (or a boxed receiver, which makes the
			// declaring type a reference type)
			if virtual_call {
				return Err(self
					.error(ErrorKind::ThisMismatch)
					.with(ErrorArgument::Detail("callvirt on a value-type receiver requires constrained.")));
			}
			let compatible = this.kind() == SlotKind::ByRef
				&& this.type_identity() == Some(declaring)
				&& !this.is_read_only();
			return match compatible {
				true => Ok(()),
				false => Err(self.expected_found(ErrorKind::ThisMismatch, &declaring, this)),
			};
		}

		match this.kind() {
			SlotKind::ObjRef => {
				if let Some(ty) = this.type_identity() {
					if !self.sys.is_assignable_to(ty, declaring) {
						return Err(self.expected_found(ErrorKind::ThisMismatch, &declaring, this));
					}
				}
				// a non-virtual call to a virtual method must not bypass the
				// vtable of a receiver that might be a subclass
				if !virtual_call && self.sys.method_is_virtual(callee) && !this.is_this_ptr() {
					return Err(self
						.error(ErrorKind::ThisMismatch)
						.with(ErrorArgument::Detail("call to a virtual method on an arbitrary receiver")));
				}
				Ok(())
			}
			SlotKind::ByRef => {
				let generic = this
					.type_identity()
					.is_some_and(|ty| self.sys.kind(ty) == TypeKind::GenericParameter);
				match generic {
					true => Err(self
						.error(ErrorKind::ConservativeReject)
						.with(ErrorArgument::Detail("generic-parameter receiver requires constrained."))),
					false => Err(self.expected_found(ErrorKind::ThisMismatch, &declaring, this)),
				}
			}
			_ => Err(self.expected_found(ErrorKind::ThisMismatch, &declaring, this)),
		}
	}

	fn do_newobj(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let constructor = self.resolve_method(token)?;
		if !self.sys.method_is_constructor(constructor) || self.sys.method_is_static(constructor) {
			return Err(self
				.error(ErrorKind::TokenResolution)
				.with(ErrorArgument::Token(token))
				.with(ErrorArgument::Detail("newobj needs an instance constructor")));
		}
		if !self.sys.method_is_accessible(constructor, self.declaring_type) {
			return Err(self.error(ErrorKind::MethodAccess).with(ErrorArgument::Token(token)));
		}
		let declaring = self.sys.method_declaring_type(constructor);
		if self.sys.is_abstract(declaring) {
			return Err(self
				.error(ErrorKind::TokenResolution)
				.with(ErrorArgument::Token(token))
				.with(ErrorArgument::Detail("cannot instantiate an abstract type")));
		}
		for &parameter in self.sys.method_parameters(constructor).iter().rev() {
			let slot = self.pop()?;
			if !slot_assignable_to(self.sys, &slot, parameter, false) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &parameter, &slot));
			}
		}
		self.push_flow(StackSlot::of_type(self.sys, declaring))
	}

	// ------------------------------------------------------------ indirection

	fn pop_address(&mut self, writable: bool) -> Result<Slot<T>, VerifyError> {
		let slot = self.pop()?;
		if slot.kind() != SlotKind::ByRef {
			return Err(self.found(ErrorKind::ExpectedByRef, &slot));
		}
		if writable && slot.is_read_only() {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Detail("store through a read-only pointer")));
		}
		Ok(slot)
	}

	fn do_ldind(&mut self, target: WellKnownType, result: SlotKind) -> Result<Flow, VerifyError> {
		let address = self.pop_address(false)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		let target = self.sys.well_known(target);
		if !verification_types_match(self.sys, element, target) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &target, &address));
		}
		self.push_flow(Self::kind_slot(result))
	}

	fn do_ldind_ref(&mut self) -> Result<Flow, VerifyError> {
		let address = self.pop_address(false)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		if !self.sys.kind(element).is_reference() {
			return Err(self.found(ErrorKind::ExpectedObjRef, &address));
		}
		self.push_flow(StackSlot::obj_ref(element))
	}

	fn do_stind(&mut self, target: WellKnownType, value_kind: SlotKind) -> Result<Flow, VerifyError> {
		let value = self.pop()?;
		let address = self.pop_address(true)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		let target = self.sys.well_known(target);
		if !verification_types_match(self.sys, element, target) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &target, &address));
		}
		let ok = match value_kind {
			// int32 widens into a native-int store
			SlotKind::NativeInt => matches!(value.kind(), SlotKind::NativeInt | SlotKind::Int32),
			kind => value.kind() == kind,
		};
		match ok {
			true => Ok(Flow::Next),
			false => Err(self.found(ErrorKind::StackUnexpected, &value)),
		}
	}

	fn do_stind_ref(&mut self) -> Result<Flow, VerifyError> {
		let value = self.pop()?;
		let address = self.pop_address(true)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		if !self.sys.kind(element).is_reference() {
			return Err(self.found(ErrorKind::ExpectedObjRef, &address));
		}
		if !slot_assignable_to(self.sys, &value, element, false) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &element, &value));
		}
		Ok(Flow::Next)
	}

	fn do_ldobj(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let address = self.pop_address(false)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		if !verification_types_match(self.sys, element, ty) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &address));
		}
		self.push_flow(StackSlot::of_type(self.sys, ty))
	}

	fn do_stobj(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let value = self.pop()?;
		let address = self.pop_address(true)?;
		let element = address.type_identity().expect("by-ref slot always has an element");
		if !verification_types_match(self.sys, element, ty) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &address));
		}
		if !slot_assignable_to(self.sys, &value, ty, true) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &value));
		}
		Ok(Flow::Next)
	}

	fn do_cpobj(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let source = self.pop_address(false)?;
		let destination = self.pop_address(true)?;
		for address in [&source, &destination] {
			let element = address.type_identity().expect("by-ref slot always has an element");
			if !verification_types_match(self.sys, element, ty) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, address));
			}
		}
		Ok(Flow::Next)
	}

	// ------------------------------------------------------------------ fields

	/// `this` compatibility for instance field access. Static fields accept
	/// and ignore any owner the instance forms take.
	fn check_field_owner(&self, owner: &Slot<T>, declaring: T::Type, is_static: bool) -> Result<(), VerifyError> {
		if is_static {
			return match owner.kind() {
				SlotKind::ObjRef | SlotKind::ByRef | SlotKind::ValueType => Ok(()),
				_ => Err(self.found(ErrorKind::StackUnexpected, owner)),
			};
		}
		let compatible = match owner.kind() {
			SlotKind::ObjRef => match owner.type_identity() {
				None => true,
				Some(ty) => self.sys.is_assignable_to(ty, declaring),
			},
			SlotKind::ByRef => owner.type_identity() == Some(declaring),
			SlotKind::ValueType => owner.type_identity() == Some(declaring),
			_ => false,
		};
		match compatible {
			true => Ok(()),
			false => Err(self.expected_found(ErrorKind::StackUnexpected, &declaring, owner)),
		}
	}

	fn in_constructor_of(&self, ty: T::Type) -> bool {
		self.sys.method_is_constructor(self.method) && self.declaring_type == ty
	}

	fn do_ldfld(&mut self, token: MetadataToken, address: bool) -> Result<Flow, VerifyError> {
		let field = self.resolve_field(token)?;
		if !self.sys.field_is_accessible(field, self.declaring_type) {
			return Err(self.error(ErrorKind::FieldAccess).with(ErrorArgument::Token(token)));
		}
		let declaring = self.sys.field_declaring_type(field);
		let field_type = self.sys.field_type(field);
		let is_static = self.sys.field_is_static(field);
		let owner = self.pop()?;
		self.check_field_owner(&owner, declaring, is_static)?;
		match address {
			false => self.push_flow(StackSlot::of_type(self.sys, field_type)),
			true => {
				if self.sys.field_is_init_only(field) && !self.in_constructor_of(declaring) {
					return Err(self
						.error(ErrorKind::FieldAccess)
						.with(ErrorArgument::Detail("address of an initonly field outside its constructor")));
				}
				let flags = match (is_static, owner.kind()) {
					(true, _) => SlotFlags::PERMANENT_HOME,
					(false, SlotKind::ObjRef) => SlotFlags::PERMANENT_HOME,
					(false, SlotKind::ByRef) => {
						owner.flags() & (SlotFlags::PERMANENT_HOME | SlotFlags::READ_ONLY)
					}
					_ => SlotFlags::empty(),
				};
				self.push_flow(StackSlot::byref(field_type).with_flags(flags))
			}
		}
	}

	fn do_stfld(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let field = self.resolve_field(token)?;
		if !self.sys.field_is_accessible(field, self.declaring_type) {
			return Err(self.error(ErrorKind::FieldAccess).with(ErrorArgument::Token(token)));
		}
		let declaring = self.sys.field_declaring_type(field);
		let field_type = self.sys.field_type(field);
		let is_static = self.sys.field_is_static(field);
		let value = self.pop()?;
		let owner = self.pop()?;
		if owner.kind() == SlotKind::ValueType {
			// a value sitting on the stack has no home to store into
			return Err(self.found(ErrorKind::StackUnexpected, &owner));
		}
		if owner.kind() == SlotKind::ByRef && owner.is_read_only() {
			return Err(self
				.error(ErrorKind::StackUnexpected)
				.with(ErrorArgument::Detail("store through a read-only pointer")));
		}
		self.check_field_owner(&owner, declaring, is_static)?;
		if !is_static && self.sys.field_is_init_only(field) && !self.in_constructor_of(declaring) {
			return Err(self
				.error(ErrorKind::FieldAccess)
				.with(ErrorArgument::Detail("store to an initonly field outside its constructor")));
		}
		if !slot_assignable_to(self.sys, &value, field_type, false) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &field_type, &value));
		}
		Ok(Flow::Next)
	}

	fn checked_static_field(&self, token: MetadataToken) -> Result<T::Field, VerifyError> {
		let field = self.resolve_field(token)?;
		if !self.sys.field_is_static(field) {
			return Err(self.error(ErrorKind::ExpectedStaticField).with(ErrorArgument::Token(token)));
		}
		if !self.sys.field_is_accessible(field, self.declaring_type) {
			return Err(self.error(ErrorKind::FieldAccess).with(ErrorArgument::Token(token)));
		}
		Ok(field)
	}

	fn do_ldsfld(&mut self, token: MetadataToken, address: bool) -> Result<Flow, VerifyError> {
		let field = self.checked_static_field(token)?;
		let field_type = self.sys.field_type(field);
		match address {
			false => self.push_flow(StackSlot::of_type(self.sys, field_type)),
			true => {
				let declaring = self.sys.field_declaring_type(field);
				if self.sys.field_is_init_only(field) && !self.in_constructor_of(declaring) {
					return Err(self
						.error(ErrorKind::FieldAccess)
						.with(ErrorArgument::Detail("address of an initonly field outside its constructor")));
				}
				self.push_flow(StackSlot::byref(field_type).with_flag(SlotFlags::PERMANENT_HOME))
			}
		}
	}

	fn do_stsfld(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let field = self.checked_static_field(token)?;
		let declaring = self.sys.field_declaring_type(field);
		if self.sys.field_is_init_only(field) && !self.in_constructor_of(declaring) {
			return Err(self
				.error(ErrorKind::FieldAccess)
				.with(ErrorArgument::Detail("store to an initonly field outside its constructor")));
		}
		let field_type = self.sys.field_type(field);
		let value = self.pop()?;
		match slot_assignable_to(self.sys, &value, field_type, false) {
			true => Ok(Flow::Next),
			false => Err(self.expected_found(ErrorKind::StackUnexpected, &field_type, &value)),
		}
	}

	// ------------------------------------------------------------------ arrays

	fn expect_array(&self, slot: &Slot<T>) -> Result<Option<T::Type>, VerifyError> {
		if slot.kind() != SlotKind::ObjRef {
			return Err(self.found(ErrorKind::ExpectedArray, slot));
		}
		match slot.type_identity() {
			None => Ok(None),
			Some(ty) if self.sys.kind(ty) == TypeKind::Array => Ok(Some(ty)),
			Some(_) => Err(self.found(ErrorKind::ExpectedArray, slot)),
		}
	}

	/// Pop index and array for an element access; `None` element means a
	/// statically null array, which any element type satisfies.
	fn pop_element_access(&mut self) -> Result<Option<T::Type>, VerifyError> {
		let index = self.pop()?;
		if !matches!(index.kind(), SlotKind::Int32 | SlotKind::NativeInt) {
			return Err(self.found(ErrorKind::ExpectedIntegerType, &index));
		}
		let array = self.pop()?;
		match self.expect_array(&array)? {
			None => Ok(None),
			Some(ty) => {
				if !self.sys.is_sz_array(ty) {
					return Err(self.found(ErrorKind::ExpectedArray, &array));
				}
				Ok(self.sys.element_type(ty))
			}
		}
	}

	fn element_compatible(&self, element: T::Type, expected: T::Type) -> bool {
		verification_types_match(self.sys, element, expected)
			|| (self.sys.kind(element).is_reference()
				&& self.sys.kind(expected).is_reference()
				&& self.sys.is_assignable_to(element, expected))
	}

	fn do_ldelem(&mut self, expected: Option<WellKnownType>, result: SlotKind) -> Result<Flow, VerifyError> {
		let element = self.pop_element_access()?;
		match (expected, element) {
			(Some(expected), Some(element)) => {
				let expected = self.sys.well_known(expected);
				if !self.element_compatible(element, expected) {
					return Err(self.expected_found(ErrorKind::StackUnexpected, &expected, &element));
				}
			}
			(None, Some(element)) => {
				// ldelem.ref needs a reference-typed element
				if !self.sys.kind(element).is_reference() {
					return Err(self.found(ErrorKind::ExpectedObjRef, &element));
				}
			}
			(_, None) => {}
		}
		match (result, element) {
			(SlotKind::ObjRef, Some(element)) => self.push_flow(StackSlot::obj_ref(element)),
			(SlotKind::ObjRef, None) => self.push_flow(StackSlot::null_ref()),
			(kind, _) => self.push_flow(Self::kind_slot(kind)),
		}
	}

	fn do_ldelem_token(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let element = self.pop_element_access()?;
		if let Some(element) = element {
			if !self.element_compatible(element, ty) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &element));
			}
		}
		self.push_flow(StackSlot::of_type(self.sys, ty))
	}

	fn do_stelem(&mut self, expected: Option<WellKnownType>, value_kind: SlotKind) -> Result<Flow, VerifyError> {
		let value = self.pop()?;
		let element = self.pop_element_access()?;
		if let (Some(expected), Some(element)) = (expected, element) {
			let expected = self.sys.well_known(expected);
			if !self.element_compatible(element, expected) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &expected, &element));
			}
		}
		if let (None, Some(element)) = (expected, element) {
			if !self.sys.kind(element).is_reference() {
				return Err(self.found(ErrorKind::ExpectedObjRef, &element));
			}
		}
		let ok = match value_kind {
			// stelem.ref leaves the element-type check to the runtime's
			// covariance check
			SlotKind::ObjRef => value.kind() == SlotKind::ObjRef,
			SlotKind::NativeInt => matches!(value.kind(), SlotKind::NativeInt | SlotKind::Int32),
			kind => value.kind() == kind,
		};
		match ok {
			true => Ok(Flow::Next),
			false => Err(self.found(ErrorKind::StackUnexpected, &value)),
		}
	}

	fn do_stelem_token(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let value = self.pop()?;
		let element = self.pop_element_access()?;
		if let Some(element) = element {
			if !self.element_compatible(element, ty) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &element));
			}
		}
		if !slot_assignable_to(self.sys, &value, ty, true) {
			return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &value));
		}
		Ok(Flow::Next)
	}

	fn do_ldelema(&mut self, token: MetadataToken, readonly: bool) -> Result<Flow, VerifyError> {
		let ty = self.resolve_type(token)?;
		let element = self.pop_element_access()?;
		if let Some(element) = element {
			// the readonly. prefix waives the exact type check
			if !readonly && !verification_types_match(self.sys, element, ty) {
				return Err(self.expected_found(ErrorKind::StackUnexpected, &ty, &element));
			}
		}
		let mut flags = SlotFlags::PERMANENT_HOME;
		if readonly {
			flags |= SlotFlags::READ_ONLY;
		}
		self.push_flow(StackSlot::byref(ty).with_flags(flags))
	}

	// ----------------------------------------------------------------- tokens

	fn pop_typed_reference(&mut self) -> Result<(), VerifyError> {
		let slot = self.pop()?;
		let typed_reference = self.sys.well_known(WellKnownType::TypedReference);
		if slot.kind() != SlotKind::ValueType || slot.type_identity() != Some(typed_reference) {
			return Err(self.found(ErrorKind::ExpectedValueType, &slot));
		}
		Ok(())
	}

	fn do_ldtoken(&mut self, token: MetadataToken) -> Result<Flow, VerifyError> {
		let handle = match token.kind() {
			_ if token.is_type() => {
				self.resolve_type(token)?;
				WellKnownType::RuntimeTypeHandle
			}
			MetadataTokenKind::Method | MetadataTokenKind::MethodSpec => {
				self.resolve_method(token)?;
				WellKnownType::RuntimeMethodHandle
			}
			MetadataTokenKind::Field => {
				self.resolve_field(token)?;
				WellKnownType::RuntimeFieldHandle
			}
			MetadataTokenKind::MemberRef => match self.sys.resolve_method(token, self.method) {
				Some(_) => WellKnownType::RuntimeMethodHandle,
				None => {
					self.resolve_field(token)?;
					WellKnownType::RuntimeFieldHandle
				}
			},
			_ => {
				return Err(self.error(ErrorKind::TokenResolution).with(ErrorArgument::Token(token)));
			}
		};
		self.push_flow(StackSlot::value_type(self.sys.well_known(handle)))
	}
}

/// Which one-shot prefixes the given instruction may consume. `constrained.`
/// is deliberately restricted to `callvirt`.
fn allowed_prefixes(op: &OpCode) -> PrefixFlags {
	match op {
		OpCode::ldind_i1 | OpCode::ldind_u1 | OpCode::ldind_i2 | OpCode::ldind_u2
		| OpCode::ldind_i4 | OpCode::ldind_u4 | OpCode::ldind_i8 | OpCode::ldind_i
		| OpCode::ldind_r4 | OpCode::ldind_r8 | OpCode::ldind_ref
		| OpCode::stind_ref | OpCode::stind_i1 | OpCode::stind_i2 | OpCode::stind_i4
		| OpCode::stind_i8 | OpCode::stind_r4 | OpCode::stind_r8 | OpCode::stind_i
		| OpCode::ldobj(_) | OpCode::stobj(_) | OpCode::ldfld(_) | OpCode::stfld(_) => {
			PrefixFlags::VOLATILE | PrefixFlags::UNALIGNED | PrefixFlags::NO_CHECKS
		}
		OpCode::ldsfld(_) | OpCode::stsfld(_) => PrefixFlags::VOLATILE | PrefixFlags::NO_CHECKS,
		OpCode::call(_) | OpCode::calli(_) => PrefixFlags::TAIL,
		OpCode::callvirt(_) => PrefixFlags::TAIL | PrefixFlags::CONSTRAINED,
		OpCode::ldelema(_) => PrefixFlags::READONLY | PrefixFlags::NO_CHECKS,
		OpCode::castclass(_) | OpCode::isinst(_) | OpCode::unbox(_) | OpCode::unbox_any(_)
		| OpCode::box_val(_) | OpCode::newarr(_)
		| OpCode::ldelem_i1 | OpCode::ldelem_u1 | OpCode::ldelem_i2 | OpCode::ldelem_u2
		| OpCode::ldelem_i4 | OpCode::ldelem_u4 | OpCode::ldelem_i8 | OpCode::ldelem_i
		| OpCode::ldelem_r4 | OpCode::ldelem_r8 | OpCode::ldelem_ref | OpCode::ldelem(_)
		| OpCode::stelem_i | OpCode::stelem_i1 | OpCode::stelem_i2 | OpCode::stelem_i4
		| OpCode::stelem_i8 | OpCode::stelem_r4 | OpCode::stelem_r8 | OpCode::stelem_ref
		| OpCode::stelem(_) | OpCode::ldflda(_) | OpCode::ldsflda(_) | OpCode::ldlen => {
			PrefixFlags::NO_CHECKS
		}
		OpCode::extended(ExtendedOpCode::initobj(_))
		| OpCode::extended(ExtendedOpCode::cpblk)
		| OpCode::extended(ExtendedOpCode::initblk) => {
			PrefixFlags::VOLATILE | PrefixFlags::UNALIGNED | PrefixFlags::NO_CHECKS
		}
		_ => PrefixFlags::empty(),
	}
}
