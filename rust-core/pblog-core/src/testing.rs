//! Test doubles shared by unit tests.

use crate::database::{Connection, Driver, Row};
use crate::error::{Error, Result};
use crate::statement::{Placeholder, Statement};
use std::sync::{Arc, Mutex};

/// Something the recording driver observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Execute(String),
    Query(String),
    Commit,
    Rollback,
    Close,
}

/// Driver that records every call and returns canned rows
#[derive(Clone, Default)]
pub struct RecordingDriver {
    events: Arc<Mutex<Vec<Event>>>,
    rows: Vec<Row>,
    fail_commit: bool,
    fail_rollback: bool,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl Driver for RecordingDriver {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        self.events.lock().unwrap().push(Event::Connect);
        Ok(Box::new(RecordingConnection {
            driver: self.clone(),
        }))
    }

    fn placeholder(&self) -> Placeholder {
        Placeholder::Qmark
    }
}

struct RecordingConnection {
    driver: RecordingDriver,
}

impl RecordingConnection {
    fn record(&self, event: Event) {
        self.driver.events.lock().unwrap().push(event);
    }
}

impl Connection for RecordingConnection {
    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.record(Event::Execute(statement.sql.clone()));
        Ok(1)
    }

    fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.record(Event::Query(statement.sql.clone()));
        Ok(self.driver.rows.clone())
    }

    fn commit(&mut self) -> Result<()> {
        self.record(Event::Commit);
        if self.driver.fail_commit {
            return Err(Error::database("commit refused"));
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.record(Event::Rollback);
        if self.driver.fail_rollback {
            return Err(Error::database("rollback refused"));
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.record(Event::Close);
        Ok(())
    }
}
