//! Ready-made contract programs used by demos and tests

use super::vm::{Instruction, OpCode};

/// Counter: increments the persistent `counter` slot by one per call.
///
/// Costs 58 gas per call (PUSH 3 + LOAD 20 + ADD 5 + STORE 20 + RETURN 10).
pub fn counter_program() -> Vec<Instruction> {
    vec![
        Instruction::push(1),
        Instruction::load("counter"),
        Instruction::bare(OpCode::Add),
        Instruction::store("counter"),
        Instruction::bare(OpCode::Return),
    ]
}

/// Token: seeds a fixed `total_supply` of 1000 units.
pub fn token_program() -> Vec<Instruction> {
    vec![
        Instruction::push(1000),
        Instruction::store("total_supply"),
        Instruction::bare(OpCode::Return),
    ]
}

/// Escrow: initializes an empty `escrow_amount` slot.
pub fn escrow_program() -> Vec<Instruction> {
    vec![
        Instruction::push(0),
        Instruction::store("escrow_amount"),
        Instruction::bare(OpCode::Return),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractVm, ExecutionContext, SmartContract};

    #[test]
    fn token_program_seeds_supply() {
        let mut contract = SmartContract::new("0xc", "0xa", "Token", "vm", token_program(), 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert!(outcome.success);
        assert_eq!(contract.get_storage("total_supply").as_integer().unwrap(), 1000);
    }

    #[test]
    fn escrow_program_initializes_slot() {
        let mut contract = SmartContract::new("0xc", "0xa", "Escrow", "vm", escrow_program(), 0);
        let outcome = ContractVm::new().execute(&mut contract, ExecutionContext::new("0xcaller", "0xc"));
        assert!(outcome.success);
        assert!(contract.storage.contains_key("escrow_amount"));
    }
}
