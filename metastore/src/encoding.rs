//! Encoding for the opaque payload carried by consensus entries (§6): a
//! self-describing, deterministic record identifying `{seq_num, op}`, byte-
//! identity-preserving for key/value bytes. Serde derives plus `bincode`
//! satisfy all three properties without hand-rolling a wire format, the
//! same choice the log/storage layers already make for on-disk records.

use common::errors::*;
use serde::{Deserialize, Serialize};

use crate::txn::Txn;

#[derive(Debug, Clone, Serialize, Deserialize)]
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
    Txn(TxnPayload),
    LeaseGrant {
        ttl_millis: u64,
        requested_id: Option<u64>,
    },
    LeaseRevoke {
        lease_id: u64,
    },
    /// Renewals are committed entries, not local mutations: deadlines must
    /// only advance once a renewal is durably ordered, never on receipt of
    /// the request (§4.5 correctness policy), so keep-alive goes through
    /// the same apply pipeline as every other mutating op even though it
    /// never touches a revision.
    LeaseKeepAlive {
        lease_id: u64,
        new_ttl_millis: Option<u64>,
    },
    Compact {
        up_to_rev: u64,
    },
}

/// `Txn` is not itself `Serialize` (it is built directly from client
/// request types by the facade); this mirrors its shape field-for-field for
/// the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnPayload {
    pub compares: Vec<ComparePayload>,
    pub then_ops: Vec<OpPayload>,
    pub else_ops: Vec<OpPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparePayload {
    pub target: u8,
    pub key: Vec<u8>,
    pub result: u8,
    pub operand_int: Option<i64>,
    pub operand_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OpPayload {
    Put { key: Vec<u8>, value: Vec<u8>, lease_id: u64 },
    DeleteRange { key: Vec<u8>, range_end: Vec<u8> },
    GetRange { key: Vec<u8>, range_end: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub seq_num: u64,
    pub op: Op,
}

pub fn encode(entry: &Entry) -> Result<Vec<u8>> {
    bincode::serialize(entry).map_err(|e| err_msg(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<Entry> {
    bincode::deserialize(bytes).map_err(|e| err_msg(e.to_string()))
}

fn compare_target_tag(t: crate::txn::CompareTarget) -> u8 {
    match t {
        crate::txn::CompareTarget::Version => 0,
        crate::txn::CompareTarget::CreateRevision => 1,
        crate::txn::CompareTarget::ModRevision => 2,
        crate::txn::CompareTarget::Value => 3,
        crate::txn::CompareTarget::LeaseId => 4,
    }
}

fn compare_target_from_tag(tag: u8) -> Result<crate::txn::CompareTarget> {
    Ok(match tag {
        0 => crate::txn::CompareTarget::Version,
        1 => crate::txn::CompareTarget::CreateRevision,
        2 => crate::txn::CompareTarget::ModRevision,
        3 => crate::txn::CompareTarget::Value,
        4 => crate::txn::CompareTarget::LeaseId,
        _ => return Err(err_msg("unknown compare target tag")),
    })
}

fn compare_result_tag(r: crate::txn::CompareResult) -> u8 {
    use crate::txn::CompareResult::*;
    match r {
        Less => 0,
        LessOrEqual => 1,
        Equal => 2,
        GreaterOrEqual => 3,
        Greater => 4,
        NotEqual => 5,
    }
}

fn compare_result_from_tag(tag: u8) -> Result<crate::txn::CompareResult> {
    use crate::txn::CompareResult::*;
    Ok(match tag {
        0 => Less,
        1 => LessOrEqual,
        2 => Equal,
        3 => GreaterOrEqual,
        4 => Greater,
        5 => NotEqual,
        _ => return Err(err_msg("unknown compare result tag")),
    })
}

pub fn txn_to_payload(txn: &Txn) -> TxnPayload {
    TxnPayload {
        compares: txn
            .compares
            .iter()
            .map(|c| {
                let (operand_int, operand_bytes) = match &c.operand {
                    crate::txn::CompareOperand::Int(i) => (Some(*i), None),
                    crate::txn::CompareOperand::Bytes(b) => (None, Some(b.clone())),
                };
                ComparePayload {
                    target: compare_target_tag(c.target),
                    key: c.key.clone(),
                    result: compare_result_tag(c.result),
                    operand_int,
                    operand_bytes,
                }
            })
            .collect(),
        then_ops: txn.then_ops.iter().map(op_to_payload).collect(),
        else_ops: txn.else_ops.iter().map(op_to_payload).collect(),
    }
}

fn op_to_payload(op: &crate::txn::Op) -> OpPayload {
    match op {
        crate::txn::Op::Put { key, value, lease_id } => OpPayload::Put {
            key: key.clone(),
            value: value.clone(),
            lease_id: *lease_id,
        },
        crate::txn::Op::DeleteRange { key, range_end } => OpPayload::DeleteRange {
            key: key.clone(),
            range_end: range_end.clone(),
        },
        crate::txn::Op::GetRange { key, range_end } => OpPayload::GetRange {
            key: key.clone(),
            range_end: range_end.clone(),
        },
    }
}

pub fn payload_to_txn(payload: &TxnPayload) -> Result<Txn> {
    let mut compares = vec![];
    for c in &payload.compares {
        let operand = if let Some(i) = c.operand_int {
            crate::txn::CompareOperand::Int(i)
        } else if let Some(b) = &c.operand_bytes {
            crate::txn::CompareOperand::Bytes(b.clone())
        } else {
            return Err(err_msg("compare payload missing operand"));
        };
        compares.push(crate::txn::Compare {
            target: compare_target_from_tag(c.target)?,
            key: c.key.clone(),
            result: compare_result_from_tag(c.result)?,
            operand,
        });
    }

    Ok(Txn {
        compares,
        then_ops: payload.then_ops.iter().map(payload_to_op).collect(),
        else_ops: payload.else_ops.iter().map(payload_to_op).collect(),
    })
}

fn payload_to_op(payload: &OpPayload) -> crate::txn::Op {
    match payload {
        OpPayload::Put { key, value, lease_id } => crate::txn::Op::Put {
            key: key.clone(),
            value: value.clone(),
            lease_id: *lease_id,
        },
        OpPayload::DeleteRange { key, range_end } => crate::txn::Op::DeleteRange {
            key: key.clone(),
            range_end: range_end.clone(),
        },
        OpPayload::GetRange { key, range_end } => crate::txn::Op::GetRange {
            key: key.clone(),
            range_end: range_end.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_put_entry() {
        let entry = Entry {
            seq_num: 7,
            op: Op::Put {
                key: vec![0, 1, 2, 255],
                value: b"value".to_vec(),
                lease_id: 0,
            },
        };
        let bytes = encode(&entry).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded.op {
            Op::Put { key, value, lease_id } => {
                assert_eq!(key, vec![0, 1, 2, 255]);
                assert_eq!(value, b"value".to_vec());
                assert_eq!(lease_id, 0);
            }
            _ => panic!("wrong op"),
        }
        assert_eq!(decoded.seq_num, 7);
    }

    #[test]
    fn txn_payload_round_trips_through_real_txn_types() {
        let txn = Txn {
            compares: vec![crate::txn::Compare {
                target: crate::txn::CompareTarget::ModRevision,
                key: b"x".to_vec(),
                result: crate::txn::CompareResult::Equal,
                operand: crate::txn::CompareOperand::Int(1),
            }],
            then_ops: vec![crate::txn::Op::Put {
                key: b"x".to_vec(),
                value: b"2".to_vec(),
                lease_id: 0,
            }],
            else_ops: vec![],
        };
        let payload = txn_to_payload(&txn);
        let bytes = bincode::serialize(&payload).unwrap();
        let payload2: TxnPayload = bincode::deserialize(&bytes).unwrap();
        let txn2 = payload_to_txn(&payload2).unwrap();
        assert_eq!(txn2.compares.len(), 1);
        assert_eq!(txn2.then_ops.len(), 1);
    }
}
