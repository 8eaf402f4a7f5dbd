//! The binary's application layer: MessagePack requests that park slow work
//! in a claim-check store and let later requests collect the result.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rmpv::Value;
use serde_json::json;

use crate::claimcheck::{AdminCounts, ClaimCheckStore, Expiration, ProgressIndicator, UnitCounter, Withdrawal};
use crate::connection::Connection;
use crate::logging::{LogLevel, Logger};
use crate::message::Message;
use crate::publish::{invalid_data, read_i64, read_string, write_i64, write_string, Publishable};
use crate::wire::Request;

pub struct NodeContext {
    pub store: ClaimCheckStore<Value>,
    pub logger: Arc<Logger>,
}

impl NodeContext {
    pub fn new(store: ClaimCheckStore<Value>, logger: Arc<Logger>) -> Self {
        Self { store, logger }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClaimTarget {
    Claim(u64),
    Key(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeOp {
    /// Park `payload` behind a claim; it is deposited after `work_ms` of
    /// simulated work split into `units` progress steps.
    Reserve {
        ttl_ms: i64,
        key: Option<String>,
        payload: Value,
        work_ms: u64,
        units: u32,
    },
    Withdraw {
        target: ClaimTarget,
        close: bool,
    },
    Admin,
}

pub struct NodeRequest {
    op: NodeOp,
    reservation: Option<(u64, Arc<UnitCounter>)>,
}

impl NodeRequest {
    pub fn new(op: NodeOp) -> Self {
        Self {
            op,
            reservation: None,
        }
    }

    pub fn reserve(ttl_ms: i64, key: Option<&str>, payload: Value, work_ms: u64, units: u32) -> Self {
        Self::new(NodeOp::Reserve {
            ttl_ms,
            key: key.map(str::to_owned),
            payload,
            work_ms,
            units,
        })
    }

    pub fn withdraw(target: ClaimTarget, close: bool) -> Self {
        Self::new(NodeOp::Withdraw { target, close })
    }

    pub fn admin() -> Self {
        Self::new(NodeOp::Admin)
    }

    pub fn op(&self) -> &NodeOp {
        &self.op
    }

    fn to_value(&self) -> Value {
        let mut entries = Vec::new();
        match &self.op {
            NodeOp::Reserve {
                ttl_ms,
                key,
                payload,
                work_ms,
                units,
            } => {
                entries.push(("op", Value::from("reserve")));
                entries.push(("ttl_ms", Value::from(*ttl_ms)));
                if let Some(key) = key {
                    entries.push(("key", Value::from(key.as_str())));
                }
                entries.push(("payload", payload.clone()));
                entries.push(("work_ms", Value::from(*work_ms)));
                entries.push(("units", Value::from(*units)));
            }
            NodeOp::Withdraw { target, close } => {
                entries.push(("op", Value::from("withdraw")));
                match target {
                    ClaimTarget::Claim(claim) => entries.push(("claim", Value::from(*claim))),
                    ClaimTarget::Key(key) => entries.push(("key", Value::from(key.as_str()))),
                }
                entries.push(("close", Value::from(*close)));
            }
            NodeOp::Admin => entries.push(("op", Value::from("admin"))),
        }
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::from(key), value))
                .collect(),
        )
    }

    fn from_value(value: Value) -> io::Result<Self> {
        let Value::Map(entries) = value else {
            return Err(invalid_data("node request must be a map"));
        };
        let field = |name: &str| {
            entries
                .iter()
                .find(|(key, _)| key.as_str() == Some(name))
                .map(|(_, value)| value)
        };
        let int = |name: &str, default: i64| match field(name) {
            None => Ok(default),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| invalid_data(format!("'{name}' must be an integer"))),
        };
        let text = |name: &str| match field(name) {
            None | Some(Value::Nil) => Ok(None),
            Some(value) => value
                .as_str()
                .map(|text| Some(text.to_owned()))
                .ok_or_else(|| invalid_data(format!("'{name}' must be a string"))),
        };

        let op = match field("op").and_then(Value::as_str) {
            Some("reserve") => NodeOp::Reserve {
                ttl_ms: int("ttl_ms", 0)?,
                key: text("key")?,
                payload: field("payload").cloned().unwrap_or(Value::Nil),
                work_ms: u64::try_from(int("work_ms", 0)?)
                    .map_err(|_| invalid_data("'work_ms' must not be negative"))?,
                units: u32::try_from(int("units", 1)?)
                    .map_err(|_| invalid_data("'units' is out of range"))?,
            },
            Some("withdraw") => {
                let target = match (field("claim").and_then(Value::as_u64), text("key")?) {
                    (Some(claim), _) => ClaimTarget::Claim(claim),
                    (None, Some(key)) => ClaimTarget::Key(key),
                    (None, None) => return Err(invalid_data("withdraw needs 'claim' or 'key'")),
                };
                let close = match field("close") {
                    None => false,
                    Some(value) => value
                        .as_bool()
                        .ok_or_else(|| invalid_data("'close' must be a boolean"))?,
                };
                NodeOp::Withdraw { target, close }
            }
            Some("admin") => NodeOp::Admin,
            Some(other) => return Err(invalid_data(format!("unknown op '{other}'"))),
            None => return Err(invalid_data("missing 'op'")),
        };
        Ok(Self::new(op))
    }
}

impl Publishable for NodeRequest {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        self.to_value().write_to(output)
    }

    fn read_from(input: &mut dyn Read) -> io::Result<Self> {
        Self::from_value(Value::read_from(input)?)
    }
}

pub enum NodeResponse {
    Reserved { claim: u64 },
    Withdrawal(Withdrawal<Value>),
    UnknownKey { key: String },
    Admin(AdminCounts),
}

impl Publishable for NodeResponse {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::Reserved { claim } => {
                write_string(output, Some("reserved"))?;
                write_i64(output, to_wire(*claim)?)
            }
            Self::Withdrawal(withdrawal) => {
                write_string(output, Some("withdrawal"))?;
                withdrawal.write_to(output)
            }
            Self::UnknownKey { key } => {
                write_string(output, Some("unknown_key"))?;
                write_string(output, Some(key))
            }
            Self::Admin(counts) => {
                write_string(output, Some("admin"))?;
                for count in [
                    counts.total,
                    counts.active,
                    counts.filled,
                    counts.filling,
                    counts.incinerated,
                ] {
                    write_i64(output, to_wire(count)?)?;
                }
                Ok(())
            }
        }
    }

    fn read_from(input: &mut dyn Read) -> io::Result<Self> {
        let tag = read_string(input)?.ok_or_else(|| invalid_data("missing response tag"))?;
        match tag.as_str() {
            "reserved" => Ok(Self::Reserved {
                claim: from_wire(read_i64(input)?)?,
            }),
            "withdrawal" => Ok(Self::Withdrawal(Withdrawal::read_from(input)?)),
            "unknown_key" => Ok(Self::UnknownKey {
                key: read_string(input)?.unwrap_or_default(),
            }),
            "admin" => {
                let mut next = || read_i64(input).and_then(from_wire);
                Ok(Self::Admin(AdminCounts {
                    total: next()?,
                    active: next()?,
                    filled: next()?,
                    filling: next()?,
                    incinerated: next()?,
                }))
            }
            other => Err(invalid_data(format!("unknown response tag '{other}'"))),
        }
    }
}

fn to_wire(value: u64) -> io::Result<i64> {
    i64::try_from(value).map_err(|_| invalid_data("value exceeds wire range"))
}

fn from_wire(value: i64) -> io::Result<u64> {
    u64::try_from(value).map_err(|_| invalid_data("negative value on the wire"))
}

impl Request<NodeContext> for NodeRequest {
    type Response = NodeResponse;

    fn respond(&mut self, context: &NodeContext) -> NodeResponse {
        match &self.op {
            NodeOp::Reserve {
                ttl_ms, key, units, ..
            } => {
                let counter = Arc::new(UnitCounter::with_total(i64::from((*units).max(1))));
                let claim = context.store.reserve_drawer(
                    Expiration::from_millis(*ttl_ms),
                    key.as_deref(),
                    Some(counter.clone() as Arc<dyn ProgressIndicator>),
                );
                self.reservation = Some((claim, counter));
                NodeResponse::Reserved { claim }
            }
            NodeOp::Withdraw {
                target: ClaimTarget::Claim(claim),
                close,
            } => NodeResponse::Withdrawal(context.store.withdraw(*claim, *close)),
            NodeOp::Withdraw {
                target: ClaimTarget::Key(key),
                close,
            } => match context.store.withdraw_key(key, *close) {
                Some(withdrawal) => NodeResponse::Withdrawal(withdrawal),
                None => NodeResponse::UnknownKey { key: key.clone() },
            },
            NodeOp::Admin => NodeResponse::Admin(context.store.admin_info().counts()),
        }
    }
}

impl Message<NodeContext> for NodeRequest {
    fn handle(self: Box<Self>, context: &NodeContext, connection: &Connection) {
        let NodeRequest { op, reservation } = *self;
        let (
            NodeOp::Reserve {
                payload,
                work_ms,
                units,
                ..
            },
            Some((claim, counter)),
        ) = (op, reservation)
        else {
            return;
        };

        let started = Instant::now();
        let steps = units.max(1);
        let step = Duration::from_millis(work_ms) / steps;
        counter.mark_start();
        for _ in 0..steps {
            if !step.is_zero() {
                thread::sleep(step);
            }
            counter.inc(1);
        }
        counter.mark_end();

        if context.store.deposit(claim, payload) {
            context.logger.log(
                LogLevel::Debug,
                Some("node"),
                "deposited result",
                Some(json!({
                    "claim": claim,
                    "work_ms": started.elapsed().as_millis() as u64,
                    "peer": connection.remote_addr().to_string(),
                })),
            );
        } else {
            context.logger.warn(
                Some("node"),
                &format!("drawer {claim} was incinerated before its result arrived"),
            );
        }
    }

    fn describe(&self) -> String {
        match &self.op {
            NodeOp::Reserve { .. } => "reserve".to_owned(),
            NodeOp::Withdraw { .. } => "withdraw".to_owned(),
            NodeOp::Admin => "admin".to_owned(),
        }
    }
}
