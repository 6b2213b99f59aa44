// File: src/contracts.rs
//
// Deployment and invocation of contracts: id → {bytecode, persisted
// storage}. Each call runs a fresh VM that owns a copy of the contract's
// state; the copy is written back only on a clean termination.

use crate::bytecode::Item;
use crate::errors::VmError;
use crate::opcode::OpCode;
use crate::storage::Storage;
use crate::value::Value;
use crate::vm::VM;
use std::cmp::Ordering;
use std::collections::HashMap;

/// 2^256 as a decimal string. Ids that are decimal numerals must stay
/// below this bound to count as well-formed.
const MAX_CONTRACT_ID: &str =
    "115792089237316195423570985008687907853269984665640564039457584007913129639936";

#[derive(Debug, Clone, Default)]
pub struct ContractEntry {
    pub bytecode: Vec<Item>,
    /// Variable state carried across invocations of this contract.
    pub storage: HashMap<String, Value>,
}

/// Registry of deployed contracts. Access is serialized by the caller; a
/// single invocation never shares mutable state with another.
#[derive(Debug, Default)]
pub struct ContractManager {
    contracts: HashMap<String, ContractEntry>,
}

impl ContractManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// String-level check that a decimal id stays within 256 bits: leading
    /// zeros are stripped, the empty remainder passes, and equal-length
    /// candidates compare lexicographically. The check is applied to every
    /// id, so a short non-numeric id still participates in the duplicate
    /// check while an oversized one bypasses it entirely.
    pub fn fits_256_bits(id: &str) -> bool {
        let trimmed = id.trim_start_matches('0');
        if trimmed.is_empty() {
            return true;
        }
        match trimmed.len().cmp(&MAX_CONTRACT_ID.len()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => trimmed < MAX_CONTRACT_ID,
        }
    }

    /// Stores bytecode under a fresh id with empty storage. Redeploying a
    /// well-formed id fails; ids that flunk the 256-bit check overwrite
    /// silently.
    pub fn deploy(&mut self, contract_id: &str, bytecode: Vec<Item>) -> Result<(), VmError> {
        if self.contracts.contains_key(contract_id) && Self::fits_256_bits(contract_id) {
            return Err(VmError::contract_exists(format!(
                "contract id {contract_id} already exists"
            )));
        }
        self.contracts
            .insert(contract_id.to_string(), ContractEntry { bytecode, storage: HashMap::new() });
        Ok(())
    }

    /// Runs `function_name` inside the named contract. The contract's
    /// bytecode is re-run from the top (re-registering its functions), then
    /// an appended prologue pushes the arguments, the argument count, and
    /// the function name before `CALL_FUNC` transfers control.
    ///
    /// Returns the top of the operand stack after termination. A faulted
    /// run propagates its error and leaves the persisted storage untouched.
    pub fn call(
        &mut self,
        contract_id: &str,
        function_name: &str,
        args: &[Value],
    ) -> Result<Option<Value>, VmError> {
        let entry = self.contracts.get(contract_id).ok_or_else(|| {
            VmError::unknown_contract(format!("{contract_id} is not a deployed contract"))
        })?;

        let mut bytecode = entry.bytecode.clone();
        for arg in args.iter().rev() {
            bytecode.push(Item::Op(OpCode::Push));
            bytecode.push(Item::Value(arg.clone()));
        }
        bytecode.push(Item::Op(OpCode::Push));
        bytecode.push(Item::Value(Value::Int(args.len() as i64)));
        bytecode.push(Item::Op(OpCode::Push));
        bytecode.push(Item::Value(Value::str(function_name)));
        bytecode.push(Item::Op(OpCode::CallFunc));

        let mut vm = VM::with_storage(Storage::from_data(entry.storage.clone()));
        vm.run(bytecode)?;

        let result = vm.stack_top().cloned();
        let updated = vm.into_storage().into_data();
        if let Some(entry) = self.contracts.get_mut(contract_id) {
            entry.storage = updated;
        }
        Ok(result)
    }

    pub fn get(&self, contract_id: &str) -> Option<&ContractEntry> {
        self.contracts.get(contract_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.contracts.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PenaCompiler;
    use crate::errors::ErrorKind;

    fn compile(source: &str) -> Vec<Item> {
        PenaCompiler::new().compile(source).expect("source should compile")
    }

    const COUNTER_CONTRACT: &str = r#"
        function bump(amount) {
            total = total + amount
            return total
        }

        function read() {
            return total
        }
    "#;

    #[test]
    fn test_deploy_and_call_returns_function_result() {
        let mut manager = ContractManager::new();
        manager
            .deploy("c1", compile("function inc(n) {\nreturn n + 1\n}"))
            .expect("deploys");

        let result = manager.call("c1", "inc", &[Value::Int(41)]).expect("runs");
        assert_eq!(result, Some(Value::Int(42)));
    }

    #[test]
    fn test_duplicate_numeric_id_is_rejected() {
        let mut manager = ContractManager::new();
        manager.deploy("1", Vec::new()).expect("first deploy");
        let err = manager.deploy("1", Vec::new()).expect_err("second deploy");
        assert_eq!(err.kind, ErrorKind::ContractExists);
    }

    #[test]
    fn test_duplicate_short_string_id_is_rejected() {
        // Short non-numeric ids pass the length check, so they still
        // collide on redeploy.
        let mut manager = ContractManager::new();
        manager.deploy("c1", Vec::new()).expect("first deploy");
        assert!(manager.deploy("c1", Vec::new()).is_err());
    }

    #[test]
    fn test_oversized_id_redeploys_silently() {
        let oversized = "9".repeat(79);
        let mut manager = ContractManager::new();
        manager.deploy(&oversized, Vec::new()).expect("first deploy");
        manager.deploy(&oversized, Vec::new()).expect("silent overwrite");
    }

    #[test]
    fn test_fits_256_bits_boundaries() {
        assert!(ContractManager::fits_256_bits(""));
        assert!(ContractManager::fits_256_bits("0000"));
        assert!(ContractManager::fits_256_bits("1"));
        assert!(ContractManager::fits_256_bits(&"9".repeat(77)));
        assert!(!ContractManager::fits_256_bits(&"9".repeat(78)));
        assert!(!ContractManager::fits_256_bits(&"9".repeat(79)));
        // Leading zeros are ignored for the comparison.
        assert!(ContractManager::fits_256_bits(&format!("00{}", "9".repeat(76))));
        // 2^256 itself is out of range, one less is in.
        assert!(!ContractManager::fits_256_bits(MAX_CONTRACT_ID));
        let mut below = MAX_CONTRACT_ID.to_string();
        below.replace_range(below.len() - 1.., "5");
        assert!(ContractManager::fits_256_bits(&below));
    }

    #[test]
    fn test_call_unknown_contract_fails() {
        let mut manager = ContractManager::new();
        let err = manager.call("ghost", "f", &[]).expect_err("unknown id");
        assert_eq!(err.kind, ErrorKind::UnknownContract);
    }

    #[test]
    fn test_storage_persists_across_calls() {
        let mut manager = ContractManager::new();
        manager.deploy("counter", compile(COUNTER_CONTRACT)).expect("deploys");

        assert_eq!(
            manager.call("counter", "bump", &[Value::Int(5)]).expect("runs"),
            Some(Value::Int(5))
        );
        assert_eq!(
            manager.call("counter", "bump", &[Value::Int(3)]).expect("runs"),
            Some(Value::Int(8))
        );
        assert_eq!(manager.call("counter", "read", &[]).expect("runs"), Some(Value::Int(8)));

        let entry = manager.get("counter").expect("deployed");
        assert_eq!(entry.storage.get("total"), Some(&Value::Int(8)));
    }

    #[test]
    fn test_contracts_have_disjoint_storage() {
        let mut manager = ContractManager::new();
        manager.deploy("a", compile(COUNTER_CONTRACT)).expect("deploys");
        manager.deploy("b", compile(COUNTER_CONTRACT)).expect("deploys");

        manager.call("a", "bump", &[Value::Int(100)]).expect("runs");
        manager.call("b", "bump", &[Value::Int(1)]).expect("runs");

        assert_eq!(manager.call("a", "read", &[]).expect("runs"), Some(Value::Int(100)));
        assert_eq!(manager.call("b", "read", &[]).expect("runs"), Some(Value::Int(1)));
    }

    #[test]
    fn test_faulted_call_commits_nothing() {
        let source = r#"
            function poison(n) {
                total = 999
                crash = n / 0
                return crash
            }
        "#;
        let mut manager = ContractManager::new();
        manager.deploy("c", compile(source)).expect("deploys");
        manager.call("c", "bump_unknown", &[]).expect_err("unknown function");
        manager.call("c", "poison", &[Value::Int(1)]).expect_err("faults");

        let entry = manager.get("c").expect("deployed");
        assert!(entry.storage.is_empty(), "faulted run must not persist state");
    }

    #[test]
    fn test_arity_mismatch_surfaces_value_error() {
        let mut manager = ContractManager::new();
        manager
            .deploy("c", compile("function two(a, b) {\nreturn a + b\n}"))
            .expect("deploys");
        let err = manager.call("c", "two", &[Value::Int(1)]).expect_err("arity mismatch");
        assert_eq!(err.kind, ErrorKind::Value);
    }

    #[test]
    fn test_call_with_multiple_args_binds_in_order() {
        let mut manager = ContractManager::new();
        manager
            .deploy("c", compile("function sub(a, b) {\nreturn a - b\n}"))
            .expect("deploys");
        let result = manager.call("c", "sub", &[Value::Int(10), Value::Int(4)]).expect("runs");
        assert_eq!(result, Some(Value::Int(6)));
    }
}
