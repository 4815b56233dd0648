//! Stack-based contract virtual machine with gas metering
//!
//! Execution is deterministic: identical `(bytecode, context)` produces
//! identical storage mutations and identical gas consumption on every node.
//! A failed invocation commits nothing; gas spent before the halt stays
//! consumed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{SmartContract, Value};

/// Maximum stack depth before `StackOverflow`
pub const MAX_STACK_DEPTH: usize = 1024;

/// Default per-call gas budget
pub const DEFAULT_GAS_LIMIT: u64 = 1_000_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error("{0}")]
    Reason(String),
    #[error("Stack overflow")]
    StackOverflow,
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Out of gas")]
    OutOfGas,
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Missing operand for {0:?}")]
    MissingOperand(OpCode),
}

/// VM opcodes, one byte each on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Stop,
    Push,
    Pop,
    Dup,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Load,
    Store,
    Sload,
    Sstore,
    Call,
    Return,
    Transfer,
    Balance,
    Caller,
    Address,
    Timestamp,
    BlockNumber,
    Revert,
    Assert,
}

impl OpCode {
    /// Fixed gas cost per opcode
    pub fn gas_cost(self) -> u64 {
        match self {
            OpCode::Stop | OpCode::Push | OpCode::Pop => 3,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => 5,
            OpCode::Load | OpCode::Store => 20,
            OpCode::Sload | OpCode::Sstore => 100,
            OpCode::Transfer => 50,
            _ => 10,
        }
    }
}

/// A single bytecode instruction; PUSH carries a value, LOAD/STORE a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<Value>,
}

impl Instruction {
    pub fn bare(op: OpCode) -> Self {
        Self { op, operand: None }
    }

    pub fn push(value: impl Into<Value>) -> Self {
        Self {
            op: OpCode::Push,
            operand: Some(value.into()),
        }
    }

    pub fn load(key: &str) -> Self {
        Self {
            op: OpCode::Load,
            operand: Some(Value::Text(key.to_string())),
        }
    }

    pub fn store(key: &str) -> Self {
        Self {
            op: OpCode::Store,
            operand: Some(Value::Text(key.to_string())),
        }
    }

    fn key(&self) -> Result<String, VmError> {
        self.operand
            .as_ref()
            .map(Value::as_string)
            .ok_or(VmError::MissingOperand(self.op))
    }
}

/// Per-invocation execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Transaction sender for this call
    pub caller: String,
    /// Address of the executing contract
    pub contract_address: String,
    /// Original transaction sender
    pub origin: String,
    /// Block timestamp (unix seconds)
    pub timestamp: i64,
    /// Current block number
    pub block_number: u64,
    /// Scratch storage, discarded unless the call succeeds
    #[serde(default)]
    pub scratch: HashMap<String, Value>,
    /// Account balances visible to TRANSFER/BALANCE
    #[serde(default)]
    pub balances: HashMap<String, f64>,
    /// Gas budget for this call
    pub gas_limit: u64,
}

impl ExecutionContext {
    pub fn new(caller: &str, contract_address: &str) -> Self {
        Self {
            caller: caller.to_string(),
            contract_address: contract_address.to_string(),
            origin: caller.to_string(),
            timestamp: 0,
            block_number: 0,
            scratch: HashMap::new(),
            balances: HashMap::new(),
            gas_limit: DEFAULT_GAS_LIMIT,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_block(mut self, block_number: u64, timestamp: i64) -> Self {
        self.block_number = block_number;
        self.timestamp = timestamp;
        self
    }

    pub fn with_balances(mut self, balances: HashMap<String, f64>) -> Self {
        self.balances = balances;
        self
    }
}

/// Result of one `execute` call
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Top-of-stack at halt, `Integer(0)` when the stack was empty
    pub return_value: Value,
    pub gas_used: u64,
    pub error: Option<VmError>,
    /// Final context balances (meaningful only on success)
    pub balances: HashMap<String, f64>,
    /// Final scratch storage (meaningful only on success)
    pub scratch: HashMap<String, Value>,
}

/// The stack machine itself
pub struct ContractVm {
    stack: Vec<Value>,
    pc: usize,
    gas_remaining: u64,
    halted: bool,
}

impl ContractVm {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            pc: 0,
            gas_remaining: DEFAULT_GAS_LIMIT,
            halted: false,
        }
    }

    /// Run a contract to completion under the given context.
    ///
    /// Storage writes land on a working copy; the contract is only updated
    /// when the whole invocation succeeds.
    pub fn execute(&mut self, contract: &mut SmartContract, context: ExecutionContext) -> ExecutionOutcome {
        self.stack.clear();
        self.pc = 0;
        self.halted = false;
        self.gas_remaining = context.gas_limit;

        let mut storage = contract.storage.clone();
        let mut scratch = context.scratch.clone();
        let mut balances = context.balances.clone();

        let result = self.run(contract, &context, &mut storage, &mut scratch, &mut balances);
        let gas_used = context.gas_limit - self.gas_remaining;

        match result {
            Ok(()) => {
                contract.storage = storage;
                ExecutionOutcome {
                    success: true,
                    return_value: self.stack.last().cloned().unwrap_or_default(),
                    gas_used,
                    error: None,
                    balances,
                    scratch,
                }
            }
            Err(err) => {
                self.halted = true;
                debug!(contract = %contract.address, error = %err, gas_used, "contract execution halted");
                ExecutionOutcome {
                    success: false,
                    return_value: Value::default(),
                    gas_used,
                    error: Some(err),
                    balances: context.balances,
                    scratch: context.scratch,
                }
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn gas_remaining(&self) -> u64 {
        self.gas_remaining
    }

    fn run(
        &mut self,
        contract: &SmartContract,
        context: &ExecutionContext,
        storage: &mut std::collections::BTreeMap<String, Value>,
        scratch: &mut HashMap<String, Value>,
        balances: &mut HashMap<String, f64>,
    ) -> Result<(), VmError> {
        while !self.halted && self.pc < contract.bytecode.len() {
            let instruction = contract.bytecode[self.pc].clone();
            self.charge_gas(instruction.op)?;

            match instruction.op {
                OpCode::Stop | OpCode::Return => self.halted = true,
                OpCode::Push => {
                    let value = instruction
                        .operand
                        .clone()
                        .ok_or(VmError::MissingOperand(OpCode::Push))?;
                    self.push(value)?;
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Dup => {
                    let top = self.peek()?.clone();
                    self.push(top)?;
                }
                OpCode::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(VmError::StackUnderflow);
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                OpCode::Add => self.binary_op(|a, b| Ok(a.wrapping_add(b)))?,
                OpCode::Sub => self.binary_op(|a, b| Ok(a.wrapping_sub(b)))?,
                OpCode::Mul => self.binary_op(|a, b| Ok(a.wrapping_mul(b)))?,
                OpCode::Div => self.binary_op(|a, b| {
                    if b == 0 {
                        Err(VmError::Reason("division by zero".to_string()))
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                OpCode::Mod => self.binary_op(|a, b| {
                    if b == 0 {
                        Err(VmError::Reason("division by zero".to_string()))
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                OpCode::Load => {
                    let key = instruction.key()?;
                    let value = storage.get(&key).cloned().unwrap_or_default();
                    self.push(value)?;
                }
                OpCode::Store => {
                    let key = instruction.key()?;
                    let value = self.pop()?;
                    storage.insert(key, value);
                }
                OpCode::Sload => {
                    let key = self.pop()?.as_string();
                    let value = scratch.get(&key).cloned().unwrap_or_default();
                    self.push(value)?;
                }
                OpCode::Sstore => {
                    let value = self.pop()?;
                    let key = self.pop()?.as_string();
                    scratch.insert(key, value);
                }
                OpCode::Transfer => {
                    let amount = self.pop()?.as_integer()?;
                    let to = self.pop()?.as_string();
                    let from_balance = balances.get(&context.caller).copied().unwrap_or(0.0);
                    if from_balance < amount as f64 {
                        return Err(VmError::Reason("insufficient balance for transfer".to_string()));
                    }
                    *balances.entry(context.caller.clone()).or_insert(0.0) -= amount as f64;
                    *balances.entry(to).or_insert(0.0) += amount as f64;
                    self.push(Value::Integer(1))?;
                }
                OpCode::Balance => {
                    let address = self.pop()?.as_string();
                    let balance = balances.get(&address).copied().unwrap_or(0.0);
                    self.push(Value::Integer(balance as i64))?;
                }
                OpCode::Caller => self.push(Value::Address(context.caller.clone()))?,
                OpCode::Address => self.push(Value::Address(context.contract_address.clone()))?,
                OpCode::Timestamp => self.push(Value::Integer(context.timestamp))?,
                OpCode::BlockNumber => self.push(Value::Integer(context.block_number as i64))?,
                OpCode::Call => {
                    let _function_id = self.pop()?.as_integer()?;
                    self.push(Value::Integer(0))?;
                }
                OpCode::Revert => {
                    return Err(VmError::Reason("execution reverted".to_string()));
                }
                OpCode::Assert => {
                    if !self.peek()?.is_truthy() {
                        return Err(VmError::Reason("assertion failed".to_string()));
                    }
                    self.pop()?;
                }
            }

            self.pc += 1;
        }

        Ok(())
    }

    fn charge_gas(&mut self, op: OpCode) -> Result<(), VmError> {
        self.gas_remaining = self
            .gas_remaining
            .checked_sub(op.gas_cost())
            .ok_or(VmError::OutOfGas)?;
        Ok(())
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.stack.len() >= MAX_STACK_DEPTH {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self) -> Result<&Value, VmError> {
        self.stack.last().ok_or(VmError::StackUnderflow)
    }

    fn binary_op(&mut self, f: impl Fn(i64, i64) -> Result<i64, VmError>) -> Result<(), VmError> {
        let b = self.pop()?.as_integer()?;
        let a = self.pop()?.as_integer()?;
        self.push(Value::Integer(f(a, b)?))
    }
}

impl Default for ContractVm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::program;

    fn counter_contract() -> SmartContract {
        SmartContract::new("0xcontract", "0xcreator", "Counter", "vm", program::counter_program(), 0)
    }

    #[test]
    fn counter_increments_and_meters_gas() {
        let mut contract = counter_contract();
        let mut vm = ContractVm::new();

        for expected in 1..=3i64 {
            let outcome = vm.execute(&mut contract, ExecutionContext::new("0xcaller", "0xcontract"));
            assert!(outcome.success, "call failed: {:?}", outcome.error);
            assert_eq!(outcome.gas_used, 58);
            assert_eq!(contract.get_storage("counter").as_integer().unwrap(), expected);
        }
    }

    #[test]
    fn division_by_zero_reverts_storage() {
        let bytecode = vec![
            Instruction::push(1),
            Instruction::store("touched"),
            Instruction::push(10),
            Instruction::push(0),
            Instruction::bare(OpCode::Div),
            Instruction::bare(OpCode::Return),
        ];
        let mut contract = SmartContract::new("0xc", "0xa", "DivZero", "vm", bytecode, 0);
        let mut vm = ContractVm::new();

        let outcome = vm.execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(VmError::Reason("division by zero".to_string())));
        // the caller observes no storage change
        assert_eq!(contract.get_storage("touched"), Value::Integer(0));
    }

    #[test]
    fn stack_underflow_on_empty_pop() {
        let bytecode = vec![Instruction::bare(OpCode::Pop)];
        let mut contract = SmartContract::new("0xc", "0xa", "Pop", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert_eq!(outcome.error, Some(VmError::StackUnderflow));
    }

    #[test]
    fn stack_overflow_at_depth_limit() {
        let mut bytecode = vec![Instruction::push(1)];
        for _ in 0..MAX_STACK_DEPTH {
            bytecode.push(Instruction::bare(OpCode::Dup));
        }
        let mut contract = SmartContract::new("0xc", "0xa", "Deep", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert_eq!(outcome.error, Some(VmError::StackOverflow));
    }

    #[test]
    fn out_of_gas_is_terminal() {
        let mut contract = counter_contract();
        let context = ExecutionContext::new("0xcaller", "0xcontract").with_gas_limit(10);
        let outcome = ContractVm::new().execute(&mut contract, context);
        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(VmError::OutOfGas));
        assert_eq!(contract.get_storage("counter"), Value::Integer(0));
    }

    #[test]
    fn transfer_moves_context_balances() {
        let bytecode = vec![
            Instruction::push("0xrecipient"),
            Instruction::push(30),
            Instruction::bare(OpCode::Transfer),
            Instruction::bare(OpCode::Return),
        ];
        let mut contract = SmartContract::new("0xc", "0xa", "Pay", "vm", bytecode, 0);
        let mut balances = HashMap::new();
        balances.insert("0xcaller".to_string(), 100.0);

        let context = ExecutionContext::new("0xcaller", "0xc").with_balances(balances);
        let outcome = ContractVm::new().execute(&mut contract, context);
        assert!(outcome.success);
        assert_eq!(outcome.balances["0xcaller"], 70.0);
        assert_eq!(outcome.balances["0xrecipient"], 30.0);
    }

    #[test]
    fn transfer_with_insufficient_balance_fails() {
        let bytecode = vec![
            Instruction::push("0xrecipient"),
            Instruction::push(30),
            Instruction::bare(OpCode::Transfer),
        ];
        let mut contract = SmartContract::new("0xc", "0xa", "Pay", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert!(!outcome.success);
    }

    #[test]
    fn assert_fails_on_falsy_top() {
        let bytecode = vec![Instruction::push(0), Instruction::bare(OpCode::Assert)];
        let mut contract = SmartContract::new("0xc", "0xa", "Assert", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert_eq!(outcome.error, Some(VmError::Reason("assertion failed".to_string())));
    }

    #[test]
    fn revert_discards_scratch_writes() {
        let bytecode = vec![
            Instruction::push("key"),
            Instruction::push(42),
            Instruction::bare(OpCode::Sstore),
            Instruction::bare(OpCode::Revert),
        ];
        let mut contract = SmartContract::new("0xc", "0xa", "Revert", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert!(!outcome.success);
        assert!(outcome.scratch.is_empty());
    }

    #[test]
    fn gas_spent_before_failure_stays_consumed() {
        let bytecode = vec![
            Instruction::push(1),
            Instruction::store("x"),
            Instruction::bare(OpCode::Revert),
        ];
        let mut contract = SmartContract::new("0xc", "0xa", "Burn", "vm", bytecode, 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert_eq!(outcome.gas_used, 3 + 20 + 10);
    }

    #[test]
    fn execution_is_deterministic() {
        let run = || {
            let mut contract = counter_contract();
            let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xcontract"));
            (outcome.gas_used, contract.storage.clone())
        };
        assert_eq!(run(), run());
    }
}
