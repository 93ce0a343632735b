//! Transaction state machine (spec.md §4.2).
//!
//! Drives an `IDLE` -> `IN_TXN` -> `IDLE` lifecycle over a stream of
//! classified lines, accumulating lines into a [`Transaction`] and attaching
//! receipt metadata as it becomes available. Touched only by the serial
//! ingest task (spec.md §5 "Shared state") — no external mutation, no
//! interior locking.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::classifier;
use crate::model::{
    Amount, ClassifiedLine, LineRecord, LineType, PosMetadata, Transaction, TransactionLine,
    TransactionSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InTxn,
}

/// Events the machine emits as it processes lines. The driver (the serial
/// ingest loop) reacts to these: `Started` triggers the video coordinator's
/// `create` call; `Ended` hands a fully owned, immutable [`Transaction`] to
/// the delivery pipeline.
#[derive(Debug)]
pub enum MachineEvent {
    Started { transaction_id: Uuid },
    Ended(Transaction),
}

pub struct StateMachine {
    state: State,
    current: Option<Transaction>,
    next_position: u32,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: State::Idle,
            current: None,
            next_position: 0,
        }
    }

    /// Feed one raw physical read through cleaning, classification, and
    /// mashed-packet splitting, then drive the state machine over each
    /// resulting logical line in order (spec.md §4.2 "Any state + mashed
    /// packet").
    pub fn ingest_raw(&mut self, raw: &[u8], now: DateTime<Utc>) -> Vec<MachineEvent> {
        let mut events = Vec::new();
        for line in classifier::process(raw) {
            events.extend(self.feed(line, now));
        }
        events
    }

    /// Drive the machine over a single already-classified line.
    pub fn feed(&mut self, line: ClassifiedLine, now: DateTime<Utc>) -> Vec<MachineEvent> {
        let mut events = Vec::new();
        match self.state {
            State::Idle => {
                if line.line_type.is_structural_only() || line.line_type == LineType::Cashier {
                    return events;
                }
                let id = Uuid::new_v4();
                let mut txn = Transaction::new(id, now);
                self.next_position = 0;
                self.append(&mut txn, line, now);
                self.current = Some(txn);
                self.state = State::InTxn;
                events.push(MachineEvent::Started { transaction_id: id });
            }
            State::InTxn => {
                let mut txn = self.current.take().expect("IN_TXN implies a current transaction");
                match line.line_type {
                    LineType::EndHeader => {
                        txn.metadata.store_id = line.store_id.clone();
                        txn.metadata.drawer_id = line.drawer_id.clone();
                        txn.metadata.transaction_number = line.transaction_number.clone();
                        self.append(&mut txn, line, now);
                        backfill(&mut txn);
                        self.current = Some(txn);
                    }
                    LineType::Cashier => {
                        txn.metadata.cashier = line.cashier.clone();
                        self.append(&mut txn, line, now);
                        backfill(&mut txn);
                        txn.close();
                        self.state = State::Idle;
                        self.next_position = 0;
                        events.push(MachineEvent::Ended(txn));
                    }
                    LineType::Ignore | LineType::Empty => {
                        self.current = Some(txn);
                    }
                    _ => {
                        self.append(&mut txn, line, now);
                        self.current = Some(txn);
                    }
                }
            }
        }
        events
    }

    fn append(&mut self, txn: &mut Transaction, line: ClassifiedLine, now: DateTime<Utc>) {
        let position = self.next_position;
        self.next_position += 1;
        txn.lines.push(TransactionLine {
            line,
            arrived_at: now,
            position,
        });
    }

    /// Whether a transaction is currently open. Used by the shutdown path to
    /// decide whether to flush an in-flight transaction (spec.md §5).
    pub fn has_open_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Force-close and return whatever transaction is open, for graceful
    /// shutdown flushing. The resulting transaction never saw a `cashier`
    /// line, so `metadata.cashier` stays `None`.
    pub fn flush(&mut self) -> Option<Transaction> {
        self.state = State::Idle;
        self.next_position = 0;
        self.current.take().map(|mut txn| {
            txn.close();
            txn
        })
    }
}

/// Back-fill the now-known metadata onto every prior line of this
/// transaction (spec.md §3 "metadata discovered mid-transaction back-fills
/// every prior line of that transaction before emission").
fn backfill(txn: &mut Transaction) {
    for entry in &mut txn.lines {
        if entry.line.store_id.is_none() {
            entry.line.store_id = txn.metadata.store_id.clone();
        }
        if entry.line.drawer_id.is_none() {
            entry.line.drawer_id = txn.metadata.drawer_id.clone();
        }
        if entry.line.transaction_number.is_none() {
            entry.line.transaction_number = txn.metadata.transaction_number.clone();
        }
    }
}

/// Build the per-line records and transaction summary for a finalized
/// transaction (spec.md §4.2 "Finalization"). `pos_metadata` and
/// `nvr_event_url` are supplied by the caller since they come from
/// process-wide config and the (possibly still-unresolved) video
/// coordinator, not from the transaction itself.
pub fn build_payloads(
    txn: &Transaction,
    device_id: &str,
    device_name: &str,
    pos_metadata: &PosMetadata,
    nvr_event_url: Option<&str>,
) -> (Vec<LineRecord>, TransactionSummary) {
    let mut item_count = 0u32;
    let mut total_amount: Option<Amount> = None;
    let mut cash_amount: Option<Amount> = None;
    let mut credit_amount: Option<Amount> = None;
    let mut debit_amount: Option<Amount> = None;
    let mut preauth_amount: Option<Amount> = None;

    let mut records = Vec::with_capacity(txn.lines.len());
    for entry in &txn.lines {
        let line = &entry.line;
        match line.line_type {
            LineType::Item => item_count += 1,
            LineType::Total => {
                if let Some(a) = line.amount {
                    total_amount = Some(a);
                }
            }
            LineType::Cash => {
                if let Some(a) = line.amount {
                    cash_amount = Some(cash_amount.unwrap_or(Amount::from_cents(0)).checked_add(a));
                }
            }
            LineType::Credit => {
                if let Some(a) = line.amount {
                    credit_amount =
                        Some(credit_amount.unwrap_or(Amount::from_cents(0)).checked_add(a));
                }
            }
            LineType::Debit => {
                if let Some(a) = line.amount {
                    debit_amount =
                        Some(debit_amount.unwrap_or(Amount::from_cents(0)).checked_add(a));
                }
            }
            LineType::Preauth => {
                if let Some(a) = line.amount {
                    preauth_amount =
                        Some(preauth_amount.unwrap_or(Amount::from_cents(0)).checked_add(a));
                }
            }
            _ => {}
        }

        records.push(LineRecord {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            device_timestamp: entry.arrived_at,
            line_type: line.line_type,
            description: line.description.clone(),
            qty: line.qty,
            amount: line.amount,
            raw_text: line.text.clone(),
            parsed_successfully: line.parsed_successfully(),
            position: entry.position,
            transaction_number: line.transaction_number.clone(),
            pos_metadata: pos_metadata.clone(),
            nvr_event_url: nvr_event_url.map(|s| s.to_string()),
        });
    }

    let summary = TransactionSummary {
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        terminal_id: pos_metadata.terminal_id.clone(),
        pos_type: pos_metadata.pos_type.clone(),
        transaction_number: txn.metadata.transaction_number.clone(),
        total_amount,
        item_count,
        line_count: txn.lines.len() as u32,
        cash_amount,
        credit_amount,
        debit_amount,
        preauth_amount,
        started_at: txn.started_at,
        completed_at: Utc::now(),
        nvr_event_id: txn.nvr_event.as_ref().map(|e| e.event_id.clone()),
        pos_metadata: pos_metadata.clone(),
    };

    (records, summary)
}
