//! Shared harness for integration tests: services over fake adapters in a
//! temp directory, plus a synchronous drive loop standing in for a worker.

use otto_common::config::ConfigSet;
use otto_common::executor::ExecOutcome;
use otto_common::plan::Plan;
use otto_common::services::Services;
use otto_common::testutil::{FakeOsAdapter, FakeWebEngine};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub services: Arc<Services>,
    pub os: Arc<FakeOsAdapter>,
    pub web: Arc<FakeWebEngine>,
}

pub fn harness(configure: impl FnOnce(&mut ConfigSet)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = ConfigSet::defaults_at(dir.path());
    configure(&mut config);
    let os = Arc::new(FakeOsAdapter::new());
    let web = Arc::new(FakeWebEngine::default());
    let services =
        Arc::new(Services::new(config, os.clone(), web.clone()).unwrap());
    Harness {
        dir,
        services,
        os,
        web,
    }
}

impl Harness {
    pub fn submit(&self, plan_text: &str) -> otto_common::services::Submission {
        let plan = Plan::from_yaml_str(plan_text).unwrap();
        self.services
            .submit(plan, "test:inline", BTreeMap::new())
            .unwrap()
    }

    /// Pull one item and drive it like a worker would.
    pub fn drive_once(&self) -> ExecOutcome {
        let item = self
            .services
            .scheduler
            .acquire()
            .expect("an item should be ready");
        let outcome = self.services.executor().advance(item.run_id).unwrap();
        self.services.scheduler.release(&item.queue);
        outcome
    }

    /// Re-enqueue a suspended run (what the HITL endpoint does).
    pub fn reenqueue(&self, run_id: i64) {
        let run = self.services.store.get_run(run_id).unwrap().unwrap();
        self.services
            .scheduler
            .enqueue(&run.queue, run_id, run.priority)
            .unwrap();
    }

    /// Write `count` single-page fake PDFs under `sub`.
    pub fn seed_pdfs(&self, sub: &str, count: usize) -> String {
        let root = self.dir.path().join(sub);
        std::fs::create_dir_all(&root).unwrap();
        for i in 0..count {
            self.os.write_pdf(&root.join(format!("doc_{i:02}.pdf")), 1);
        }
        root.to_string_lossy().to_string()
    }
}
