use common::errors::*;

use crate::lease::LeaseManager;
use crate::mvcc::{MvccStore, StepGuard, WatchEvent, WatchEventType};
use crate::revision::{KeyValue, Rev};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    Version,
    CreateRevision,
    ModRevision,
    Value,
    LeaseId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Less,
    LessOrEqual,
    Equal,
    GreaterOrEqual,
    Greater,
    NotEqual,
}

#[derive(Debug, Clone)]
pub enum CompareOperand {
    Int(i64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Compare {
    pub target: CompareTarget,
    pub key: Vec<u8>,
    pub result: CompareResult,
    pub operand: CompareOperand,
}

#[derive(Debug, Clone)]
pub enum Op {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease_id: u64,
    },
    DeleteRange {
        key: Vec<u8>,
        range_end: Vec<u8>,
    },
    GetRange {
        key: Vec<u8>,
        range_end: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub then_ops: Vec<Op>,
    pub else_ops: Vec<Op>,
}

#[derive(Debug, Clone)]
pub enum OpResponse {
    Put { prev_kv: Option<KeyValue> },
    DeleteRange { deleted: u64, prev_kvs: Vec<KeyValue> },
    GetRange { kvs: Vec<KeyValue> },
}

#[derive(Debug, Clone)]
pub struct TxnResult {
    pub succeeded: bool,
    pub responses: Vec<OpResponse>,
    pub rev: Rev,
}

fn compare_ints(result: CompareResult, a: i64, b: i64) -> bool {
    match result {
        CompareResult::Less => a < b,
        CompareResult::LessOrEqual => a <= b,
        CompareResult::Equal => a == b,
        CompareResult::GreaterOrEqual => a >= b,
        CompareResult::Greater => a > b,
        CompareResult::NotEqual => a != b,
    }
}

fn compare_bytes(result: CompareResult, a: &[u8], b: &[u8]) -> bool {
    match result {
        CompareResult::Less => a < b,
        CompareResult::LessOrEqual => a <= b,
        CompareResult::Equal => a == b,
        CompareResult::GreaterOrEqual => a >= b,
        CompareResult::Greater => a > b,
        CompareResult::NotEqual => a != b,
    }
}

async fn evaluate_compare(step: &StepGuard<'_>, mvcc: &MvccStore, compare: &Compare) -> Result<bool> {
    let (kvs, _) = mvcc
        .get_range_locked(step, &compare.key, &[], 0, 1, crate::mvcc::SortOrder::Ascend, false)
        .await?;
    let kv = kvs.into_iter().next();

    Ok(match (&compare.target, &compare.operand) {
        (CompareTarget::Version, CompareOperand::Int(want)) => {
            compare_ints(compare.result, kv.map(|k| k.version as i64).unwrap_or(0), *want)
        }
        (CompareTarget::CreateRevision, CompareOperand::Int(want)) => {
            compare_ints(compare.result, kv.map(|k| k.create_revision as i64).unwrap_or(0), *want)
        }
        (CompareTarget::ModRevision, CompareOperand::Int(want)) => {
            compare_ints(compare.result, kv.map(|k| k.mod_revision as i64).unwrap_or(0), *want)
        }
        (CompareTarget::LeaseId, CompareOperand::Int(want)) => {
            compare_ints(compare.result, kv.map(|k| k.lease_id as i64).unwrap_or(0), *want)
        }
        (CompareTarget::Value, CompareOperand::Bytes(want)) => {
            compare_bytes(compare.result, kv.map(|k| k.value).unwrap_or_default().as_slice(), want)
        }
        _ => return Err(err_msg("compare target/operand type mismatch")),
    })
}

/// C6: executes a compare-then-or-else block atomically against the MVCC
/// store.
///
/// This always runs from inside the single apply step that owns `rev`: all
/// ops of the chosen branch share that one revision, and each op observes
/// the store as updated by the ops before it in the same branch (the
/// get_range calls inside this function always go through the same
/// `mvcc` reference, so a Put earlier in the branch is visible to a
/// GetRange later in the branch). Compares and `GetRange` ops read through
/// `get_range_locked` rather than `get_range`, since the step guard this
/// function already holds is a write guard on the same non-reentrant lock
/// `get_range` would otherwise try to read-acquire itself.
pub async fn execute_txn(mvcc: &MvccStore, leases: &LeaseManager, txn: &Txn, rev: Rev) -> Result<(TxnResult, Vec<WatchEvent>)> {
    let step = mvcc.begin_step().await;
    execute_txn_at(&step, mvcc, leases, txn, rev).await
}

/// Runs a transaction branch as part of an apply step already in progress
/// (e.g. one lease-cascade step that also needs to run a transaction). All
/// ops of the chosen branch share the caller's `rev` and `step`.
pub async fn execute_txn_at(
    step: &StepGuard<'_>,
    mvcc: &MvccStore,
    leases: &LeaseManager,
    txn: &Txn,
    rev: Rev,
) -> Result<(TxnResult, Vec<WatchEvent>)> {
    let mut succeeded = true;
    for compare in &txn.compares {
        if !evaluate_compare(step, mvcc, compare).await? {
            succeeded = false;
            break;
        }
    }

    let branch = if succeeded { &txn.then_ops } else { &txn.else_ops };

    let mut responses = vec![];
    let mut events = vec![];

    for op in branch {
        match op {
            Op::Put { key, value, lease_id } => {
                let prev = mvcc.put_at(step, key, value.clone(), *lease_id, rev, leases).await?;
                events.push(WatchEvent {
                    ty: WatchEventType::Put,
                    kv: crate::revision::KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        create_revision: prev.as_ref().map(|p| p.create_revision).unwrap_or(rev),
                        mod_revision: rev,
                        version: prev.as_ref().map(|p| p.version + 1).unwrap_or(1),
                        lease_id: *lease_id,
                    },
                    prev_kv: prev.clone(),
                    rev,
                });
                responses.push(OpResponse::Put { prev_kv: prev });
            }
            Op::DeleteRange { key, range_end } => {
                let deleted = mvcc.delete_range_at(step, key, range_end, rev, leases).await?;
                for prev_kv in &deleted {
                    events.push(WatchEvent {
                        ty: WatchEventType::Delete,
                        kv: crate::revision::KeyValue {
                            key: prev_kv.key.clone(),
                            value: vec![],
                            create_revision: 0,
                            mod_revision: rev,
                            version: 0,
                            lease_id: 0,
                        },
                        prev_kv: Some(prev_kv.clone()),
                        rev,
                    });
                }
                responses.push(OpResponse::DeleteRange {
                    deleted: deleted.len() as u64,
                    prev_kvs: deleted,
                });
            }
            Op::GetRange { key, range_end } => {
                let (kvs, _) = mvcc
                    .get_range_locked(step, key, range_end, 0, 0, crate::mvcc::SortOrder::Ascend, false)
                    .await?;
                responses.push(OpResponse::GetRange { kvs });
            }
        }
    }

    Ok((
        TxnResult {
            succeeded,
            responses,
            rev,
        },
        events,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn compare_against_an_absent_key_treats_it_as_zero_valued() {
        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();
        // "other" sorts after "missing"; a buggy single-key lookup that
        // scanned past the exact key would find this instead.
        let rev = mvcc.next_rev();
        let step = mvcc.begin_step().await;
        mvcc.put_at(&step, b"other", b"1".to_vec(), 0, rev, &leases).await.unwrap();

        let compare = Compare {
            target: CompareTarget::ModRevision,
            key: b"missing".to_vec(),
            result: CompareResult::Equal,
            operand: CompareOperand::Int(0),
        };
        assert!(evaluate_compare(&step, &mvcc, &compare).await.unwrap());
    }

    #[async_std::test]
    async fn failed_compare_runs_the_else_branch() {
        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();
        let rev = mvcc.next_rev();
        let txn = Txn {
            compares: vec![Compare {
                target: CompareTarget::Version,
                key: b"k".to_vec(),
                result: CompareResult::Greater,
                operand: CompareOperand::Int(0),
            }],
            then_ops: vec![Op::Put {
                key: b"k".to_vec(),
                value: b"then".to_vec(),
                lease_id: 0,
            }],
            else_ops: vec![Op::Put {
                key: b"k".to_vec(),
                value: b"else".to_vec(),
                lease_id: 0,
            }],
        };

        let (result, _) = execute_txn(&mvcc, &leases, &txn, rev).await.unwrap();
        assert!(!result.succeeded);
        match &result.responses[0] {
            OpResponse::Put { prev_kv } => assert!(prev_kv.is_none()),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[async_std::test]
    async fn a_put_earlier_in_the_branch_is_visible_to_a_later_get() {
        let mvcc = MvccStore::new(4);
        let leases = LeaseManager::new();
        let rev = mvcc.next_rev();
        let txn = Txn {
            compares: vec![],
            then_ops: vec![
                Op::Put {
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                    lease_id: 0,
                },
                Op::GetRange {
                    key: b"k".to_vec(),
                    range_end: vec![],
                },
            ],
            else_ops: vec![],
        };

        let (result, _) = execute_txn(&mvcc, &leases, &txn, rev).await.unwrap();
        match &result.responses[1] {
            OpResponse::GetRange { kvs } => {
                assert_eq!(kvs.len(), 1);
                assert_eq!(kvs[0].value, b"v");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
