use std::fmt::{Display, Formatter};

use crate::metadata_token::MetadataToken;

/// The closed set of reasons a method body fails verification.
///
/// Kinds mirror the ECMA-335 verifier error conditions; the free-form details
/// travel separately as [`ErrorArgument`]s so hosts can render them however
/// they like.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ErrorKind {
	#[error("instruction runs past the end of the method")]
	EndOfMethodInsideInstruction,
	#[error("unknown or reserved opcode")]
	InvalidOpcode,

	#[error("the evaluation stack is empty")]
	StackUnderflow,
	#[error("the evaluation stack exceeds the declared .maxstack")]
	StackOverflow,
	#[error("unexpected value on the evaluation stack")]
	StackUnexpected,
	#[error("the evaluation stack must be empty at this point")]
	UninitStack,
	#[error("expected a numeric operand")]
	ExpectedNumericType,
	#[error("expected an integer operand")]
	ExpectedIntegerType,
	#[error("expected a managed pointer")]
	ExpectedByRef,
	#[error("expected an object reference")]
	ExpectedObjRef,
	#[error("expected a value type")]
	ExpectedValueType,
	#[error("expected an array")]
	ExpectedArray,
	#[error("expected a static field")]
	ExpectedStaticField,

	#[error("token does not resolve to a suitable entity")]
	TokenResolution,
	#[error("method is not accessible from this context")]
	MethodAccess,
	#[error("field is not accessible from this context")]
	FieldAccess,
	#[error("unsuitable `this` operand for the call")]
	ThisMismatch,
	#[error("instruction can never appear in verifiable code")]
	Unverifiable,
	#[error("method declares locals without the localsinit flag")]
	InitLocals,
	#[error("construct is rejected conservatively")]
	ConservativeReject,
	#[error("argument index out of range")]
	UnknownArgument,
	#[error("local variable index out of range")]
	UnknownLocal,

	#[error("branch target is outside the method or inside an instruction")]
	InvalidBranchTarget,
	#[error("branch enters a try block")]
	BranchIntoTry,
	#[error("branch enters an exception handler")]
	BranchIntoHandler,
	#[error("branch leaves a try block without `leave`")]
	BranchOutOfTry,
	#[error("branch leaves an exception handler without `leave`")]
	BranchOutOfHandler,
	#[error("control falls into an exception handler")]
	FallthroughException,
	#[error("control falls off the end of the method")]
	FallthroughEndMethod,
	#[error("`leave` used outside a protected region or targeting it")]
	Leave,
	#[error("`rethrow` outside a catch or filter handler")]
	Rethrow,
	#[error("malformed filter clause or `endfilter` outside one")]
	EndFilter,
	#[error("`endfinally` outside a finally or fault handler")]
	EndFinally,
	#[error("malformed exception-handling region")]
	InvalidExceptionRegion,
	#[error("`localloc` inside a protected region")]
	LocallocInProtectedRegion,
	#[error("`ret` inside a protected region")]
	ReturnFromProtectedRegion,
	#[error("returned pointer does not outlive this frame")]
	ReturnPtrToStack,

	#[error("prefix is not valid for the following instruction")]
	InvalidPrefix,
	#[error("prefix repeated or combined with an incompatible prefix")]
	PrefixConsecutive,
	#[error("`tail.` call is not immediately followed by `ret`")]
	TailCallNotFollowedByRet,
	#[error("`tail.` callee return type does not match the caller's")]
	TailCallReturnMismatch,
	#[error("`tail.` call inside a protected region")]
	TailCallInProtectedRegion,
}

/// One positional argument of a verifier error, pre-rendered so the error
/// type stays independent of the oracle's handle types.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorArgument {
	Offset(u32),
	Token(MetadataToken),
	Index(u32),
	Found(String),
	Expected(String),
	Detail(&'static str),
}

impl Display for ErrorArgument {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorArgument::Offset(offset) => write!(f, "target IL_{offset:04X}"),
			ErrorArgument::Token(token) => write!(f, "{token:?}"),
			ErrorArgument::Index(index) => write!(f, "index {index}"),
			ErrorArgument::Found(found) => write!(f, "found {found}"),
			ErrorArgument::Expected(expected) => write!(f, "expected {expected}"),
			ErrorArgument::Detail(detail) => f.write_str(detail),
		}
	}
}

/// A single verifier diagnostic: what went wrong, where, and with which
/// operands.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyError {
	pub kind: ErrorKind,
	/// Offset of the instruction that was being verified.
	pub offset: u32,
	pub args: Vec<ErrorArgument>,
}

impl VerifyError {
	pub fn new(kind: ErrorKind, offset: u32) -> Self {
		Self { kind, offset, args: Vec::new() }
	}

	pub fn with(mut self, arg: ErrorArgument) -> Self {
		self.args.push(arg);
		self
	}
}

impl Display for VerifyError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "IL_{:04X}: {}", self.offset, self.kind)?;
		for (i, arg) in self.args.iter().enumerate() {
			match i {
				0 => write!(f, " ({arg}")?,
				_ => write!(f, ", {arg}")?,
			}
		}
		match self.args.is_empty() {
			true => Ok(()),
			false => write!(f, ")"),
		}
	}
}

impl std::error::Error for VerifyError {}

/// What the caller gets back when a method does not verify.
///
/// Under [`ReportPolicy::FailFast`] this holds exactly the first error; under
/// [`ReportPolicy::CollectAll`] every diagnostic the dataflow could reach.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationFailure {
	pub errors: Vec<VerifyError>,
}

impl VerificationFailure {
	pub fn first(&self) -> &VerifyError {
		&self.errors[0]
	}
}

impl Display for VerificationFailure {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self.errors.len() {
			1 => Display::fmt(self.first(), f),
			n => write!(f, "{} ({} errors in total)", self.first(), n),
		}
	}
}

impl std::error::Error for VerificationFailure {}

/// How eagerly a verification run gives up.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ReportPolicy {
	/// Stop the worklist at the first error. The runtime-integration default.
	#[default]
	FailFast,
	/// Record the error, abandon the offending basic block and keep going.
	/// Meant for diagnostic tooling.
	CollectAll,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_offset_kind_and_arguments() {
		let error = VerifyError::new(ErrorKind::StackUnexpected, 0x1A)
			.with(ErrorArgument::Expected("Int32".to_string()))
			.with(ErrorArgument::Found("Float".to_string()));
		assert_eq!(
			error.to_string(),
			"IL_001A: unexpected value on the evaluation stack (expected Int32, found Float)",
		);
	}

	#[test]
	fn renders_bare_errors_without_parentheses() {
		let error = VerifyError::new(ErrorKind::StackUnderflow, 0);
		assert_eq!(error.to_string(), "IL_0000: the evaluation stack is empty");
	}
}
