use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::publish::{
    invalid_data, read_bool, read_i32, read_i64, read_string, write_bool, write_i32, write_i64,
    write_string, Publishable,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WithdrawalStatus {
    /// The drawer exists but nothing has been deposited yet.
    NoDeposit,
    /// The claim was issued but its drawer is gone.
    Expired,
    Retrieved,
    /// The claim number was never issued.
    Unreserved,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoDeposit => "NO_DEPOSIT",
            Self::Expired => "EXPIRED",
            Self::Retrieved => "RETRIEVED",
            Self::Unreserved => "UNRESERVED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NO_DEPOSIT" => Some(Self::NoDeposit),
            "EXPIRED" => Some(Self::Expired),
            "RETRIEVED" => Some(Self::Retrieved),
            "UNRESERVED" => Some(Self::Unreserved),
            _ => None,
        }
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time result of a withdrawal. Times are epoch millis, zero when
/// the event has not happened.
pub struct Withdrawal<T> {
    claim: u64,
    status: WithdrawalStatus,
    content: Option<Arc<T>>,
    opened_at: i64,
    deposited_at: i64,
    withdrawn_at: i64,
    expires_at: i64,
    completion_ratio: Option<(i64, i64)>,
}

impl<T> Withdrawal<T> {
    pub(crate) fn new(
        claim: u64,
        status: WithdrawalStatus,
        content: Option<Arc<T>>,
        [opened_at, deposited_at, withdrawn_at, expires_at]: [i64; 4],
        completion_ratio: Option<(i64, i64)>,
    ) -> Self {
        Self {
            claim,
            status,
            content,
            opened_at,
            deposited_at,
            withdrawn_at,
            expires_at,
            completion_ratio,
        }
    }

    pub(crate) fn missing(claim: u64, status: WithdrawalStatus) -> Self {
        Self::new(claim, status, None, [0; 4], None)
    }

    pub fn claim_number(&self) -> u64 {
        self.claim
    }

    pub fn status(&self) -> WithdrawalStatus {
        self.status
    }

    pub fn content(&self) -> Option<&T> {
        self.content.as_deref()
    }

    pub fn shared_content(&self) -> Option<Arc<T>> {
        self.content.clone()
    }

    pub fn opened_at_ms(&self) -> i64 {
        self.opened_at
    }

    pub fn deposited_at_ms(&self) -> i64 {
        self.deposited_at
    }

    pub fn withdrawn_at_ms(&self) -> i64 {
        self.withdrawn_at
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at
    }

    /// `(done_so_far, to_be_done)` from the drawer's progress indicator.
    pub fn completion_ratio(&self) -> Option<(i64, i64)> {
        self.completion_ratio
    }
}

impl<T> Clone for Withdrawal<T> {
    fn clone(&self) -> Self {
        Self {
            content: self.content.clone(),
            ..*self
        }
    }
}

impl<T> fmt::Debug for Withdrawal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Withdrawal")
            .field("claim", &self.claim)
            .field("status", &self.status)
            .field("has_content", &self.content.is_some())
            .field("opened_at", &self.opened_at)
            .field("deposited_at", &self.deposited_at)
            .field("withdrawn_at", &self.withdrawn_at)
            .field("expires_at", &self.expires_at)
            .field("completion_ratio", &self.completion_ratio)
            .finish()
    }
}

impl<T: Publishable> Publishable for Withdrawal<T> {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        write_i64(output, claim_to_wire(self.claim)?)?;
        write_string(output, Some(self.status.as_str()))?;
        write_bool(output, self.content.is_some())?;
        if let Some(content) = &self.content {
            content.write_to(output)?;
        }
        for time in [
            self.opened_at,
            self.deposited_at,
            self.withdrawn_at,
            self.expires_at,
        ] {
            write_i64(output, time)?;
        }
        match self.completion_ratio {
            None => write_i32(output, -1),
            Some((done, to_be_done)) => {
                write_i32(output, 2)?;
                write_i64(output, done)?;
                write_i64(output, to_be_done)
            }
        }
    }

    fn read_from(input: &mut dyn Read) -> io::Result<Self> {
        let claim = u64::try_from(read_i64(input)?)
            .map_err(|_| invalid_data("negative claim number"))?;
        let name = read_string(input)?.ok_or_else(|| invalid_data("missing withdrawal status"))?;
        let status = WithdrawalStatus::from_name(&name)
            .ok_or_else(|| invalid_data(format!("unknown withdrawal status '{name}'")))?;
        let content = if read_bool(input)? {
            Some(Arc::new(T::read_from(input)?))
        } else {
            None
        };
        let times = [
            read_i64(input)?,
            read_i64(input)?,
            read_i64(input)?,
            read_i64(input)?,
        ];
        let completion_ratio = match read_i32(input)? {
            count if count < 0 => None,
            2 => Some((read_i64(input)?, read_i64(input)?)),
            other => {
                return Err(invalid_data(format!(
                    "completion ratio must carry 2 values, found {other}"
                )))
            }
        };
        Ok(Self::new(claim, status, content, times, completion_ratio))
    }
}

fn claim_to_wire(claim: u64) -> io::Result<i64> {
    i64::try_from(claim).map_err(|_| invalid_data("claim number exceeds wire range"))
}
