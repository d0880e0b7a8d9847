//! End-to-end probing sessions against scripted instruments.

use scpi_doom::catalog::read_command_file;
use scpi_doom::transport::{CLEAR_STATUS, ERROR_QUERY, IDN_QUERY};
use scpi_doom::{
    Catalog, Denylist, DeviceIdentity, FuzzCandidate, Outcome, ProbeConfig, Prober, Response,
    SessionLimits, Transport, TransportError,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const IDN: &str = "RIGOL TECHNOLOGIES,MSO5074,DS5A000000001,00.01.03.00.01";

/// Scripted instrument: fixed replies, a set of accepted commands, and a
/// timeout for everything else.
struct ScriptedScope {
    replies: HashMap<String, String>,
    accepts: HashSet<String>,
    sent: Vec<String>,
}

impl ScriptedScope {
    fn new(replies: &[(&str, &str)]) -> Self {
        let mut replies: HashMap<String, String> = replies
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        replies
            .entry(IDN_QUERY.to_string())
            .or_insert_with(|| IDN.to_string());
        Self {
            replies,
            accepts: HashSet::new(),
            sent: Vec::new(),
        }
    }

    fn accepting(mut self, commands: &[&str]) -> Self {
        self.accepts = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Reply "1" to every query that is not scripted otherwise.
    fn answering_everything(mut self) -> Self {
        self.accepts.insert("*".to_string());
        self
    }
}

impl Transport for ScriptedScope {
    fn query(&mut self, command: &str, timeout: Duration) -> Result<Response, TransportError> {
        self.sent.push(command.to_string());
        let payload = if let Some(reply) = self.replies.get(command) {
            reply.clone()
        } else if self.accepts.contains(command) || self.accepts.contains("*") {
            "1".to_string()
        } else if !self.accepts.is_empty() {
            "-113,\"Undefined header\"".to_string()
        } else {
            return Err(TransportError::Timeout(timeout));
        };
        Ok(Response {
            payload: payload.into_bytes(),
            elapsed: Duration::from_millis(2),
        })
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        self.sent.push(command.to_string());
        Ok(())
    }
}

fn setup(baseline: &[&str]) -> (TempDir, ProbeConfig) {
    let dir = TempDir::new().unwrap();
    let baseline_path = dir.path().join("scpi_command_list.txt");
    fs::write(&baseline_path, baseline.join("\n") + "\n").unwrap();
    let config = ProbeConfig {
        timeout: Duration::from_millis(20),
        baseline_path,
        data_dir: dir.path().join("data"),
        ..ProbeConfig::default()
    };
    (dir, config)
}

fn log_entries(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect()
}

#[test]
fn test_full_run_single_confirmed_command() {
    let (_dir, config) = setup(&[":CHAN1:SCAL?"]);
    let scope = ScriptedScope::new(&[(":CHAN1:SCAL?", "1.000E+00")]);
    let mut prober = Prober::new(scope, config);

    let identity = prober.identify_or_generic();
    assert!(!identity.is_generic());
    let catalog = Catalog::open(
        identity,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();
    let report = prober.run_test(&catalog).unwrap();

    assert_eq!(report.count(Outcome::Confirmed), 1);
    assert_eq!(report.count(Outcome::InstrumentError), 0);
    assert_eq!(report.count(Outcome::Timeout), 0);
    assert_eq!(report.count(Outcome::Malformed), 0);

    let log_path = report.log_path.clone().unwrap();
    let entries = log_entries(&log_path);
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains("CONFIRMED"));
    assert!(fs::read_to_string(&log_path).unwrap().contains(IDN));
}

#[test]
fn test_full_run_silent_command_times_out() {
    let (_dir, config) = setup(&[":CHAN1:SCAL?"]);
    let scope = ScriptedScope::new(&[]);
    let mut prober = Prober::new(scope, config);

    let identity = prober.identify_or_generic();
    let catalog = Catalog::open(
        identity,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();
    let report = prober.run_test(&catalog).unwrap();

    assert_eq!(report.count(Outcome::Timeout), 1);
    assert_eq!(report.count(Outcome::Confirmed), 0);
    assert_eq!(report.timed_out(), vec![":CHAN1:SCAL?"]);
}

#[test]
fn test_binary_reply_queries_are_never_sent() {
    let (_dir, config) = setup(&[
        ":WAVeform:DATA?",
        ":WAVE:DATA?",
        ":DISP:DATA?",
        ":WAVeform:FORMat?",
        ":DISPlay:GRADing:TIME?",
    ]);
    let scope = ScriptedScope::new(&[]).answering_everything();
    let mut prober = Prober::new(
        scope,
        ProbeConfig {
            seed: Some(3),
            ..config
        },
    );

    let identity = prober.identify_or_generic();
    let catalog = Catalog::open(
        identity,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();
    let report = prober.run_test(&catalog).unwrap();
    assert_eq!(
        report.skipped,
        vec![":WAVeform:DATA?", ":WAVE:DATA?", ":DISP:DATA?"]
    );
    assert_eq!(report.count(Outcome::Confirmed), 2);

    prober.run_fuzz(300, None).unwrap();
    let skip = ProbeConfig::default().skip_patterns;
    for command in &prober.into_transport().sent {
        assert!(!skip.matches(command), "sent binary-reply query {}", command);
    }
}

#[test]
fn test_unidentified_device_uses_generic_namespace() {
    let (_dir, config) = setup(&[":CHAN1:SCAL?"]);
    let mut scope = ScriptedScope::new(&[(":CHAN1:SCAL?", "1.0")]);
    scope.replies.remove(IDN_QUERY);
    let mut prober = Prober::new(scope, config);

    let identity = prober.identify_or_generic();
    assert!(identity.is_generic());
    assert!(prober.identify().is_err());
    assert!(prober.run_learn(10, None).is_err());
    assert!(prober.run_fuzz(10, None).is_err());
}

#[test]
fn test_learning_persists_each_new_command_once() {
    let (_dir, config) = setup(&[":CHAN1:SCAL?"]);
    let accepted = [":MATH1:OPER?", ":BUS1:MODE?", ":TRIG:SWE?"];
    let scope = ScriptedScope::new(&[]).accepting(&accepted);
    let mut prober = Prober::new(scope, config);

    let identity = prober.identify().unwrap();
    let mut catalog = Catalog::open(
        identity,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();

    // 100 candidates; the three accepted commands recur throughout
    let candidates: Vec<FuzzCandidate> = (0..100)
        .map(|i| match i % 10 {
            0 | 1 | 2 => FuzzCandidate::mutation(accepted[i % 10], None),
            _ => FuzzCandidate::mutation(&format!(":FAKE{}:NODE?", i), None),
        })
        .collect();

    let report = prober
        .learn_from(
            &mut catalog,
            candidates.clone().into_iter(),
            SessionLimits::new(100, None),
        )
        .unwrap();

    assert_eq!(report.candidates_tried, 100);
    assert_eq!(report.learned.len(), 3);
    assert!(report.unpersisted.is_empty());
    // accepted commands are only probed the first time
    assert_eq!(report.count(Outcome::Confirmed), 3);
    assert_eq!(report.count(Outcome::InstrumentError), 70);

    let store = catalog.store().unwrap();
    let on_disk = read_command_file(store.latest_path()).unwrap();
    assert_eq!(on_disk, accepted.to_vec());
    assert_eq!(read_command_file(store.snapshot_path()).unwrap().len(), 3);

    // a second session over the same candidates adds nothing
    let identity = prober.identify().unwrap();
    let mut reopened = Catalog::open(
        identity,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();
    let again = prober
        .learn_from(
            &mut reopened,
            candidates.into_iter(),
            SessionLimits::new(100, None),
        )
        .unwrap();
    assert!(again.learned.is_empty());
    assert_eq!(again.count(Outcome::Confirmed), 0);
    let store = reopened.store().unwrap();
    assert_eq!(read_command_file(store.latest_path()).unwrap().len(), 3);
}

#[test]
fn test_learning_is_scoped_to_the_probed_device() {
    let (dir, config) = setup(&[":CHAN1:SCAL?"]);
    let other =
        DeviceIdentity::resolve("RIGOL TECHNOLOGIES,MSO5074,DS5A000000002,00.01.03.00.01")
            .unwrap();
    let scope = ScriptedScope::new(&[]).answering_everything();
    let mut prober = Prober::new(
        scope,
        ProbeConfig {
            seed: Some(7),
            ..config
        },
    );

    let report = prober.run_learn(40, None).unwrap();
    assert_eq!(report.seed, Some(7));
    assert!(!report.learned.is_empty());

    let learned_root = dir.path().join("data").join("learned");
    let this = DeviceIdentity::resolve(IDN).unwrap();
    let latest = learned_root
        .join(this.key())
        .join(format!("learned_{}_latest.txt", this.key()));
    assert_eq!(read_command_file(&latest).unwrap().len(), report.learned.len());
    assert!(!learned_root.join(other.key()).exists());

    // the other device's catalog holds baseline only
    let other_catalog = Catalog::open(
        other,
        &prober.config().baseline_path,
        &prober.config().data_dir,
    )
    .unwrap();
    assert!(other_catalog.learned().is_empty());
    assert_eq!(other_catalog.len(), 1);
}

#[test]
fn test_fuzz_never_sends_denylisted_commands() {
    let (_dir, config) = setup(&[
        ":CHANnel1:SCALe?",
        ":SYSTem:ERRor?",
        ":TRIGger:MODE <e>",
        "*IDN?",
    ]);
    let scope = ScriptedScope::new(&[]).answering_everything();
    let mut prober = Prober::new(
        scope,
        ProbeConfig {
            seed: Some(11),
            ..config
        },
    );

    let report = prober.run_fuzz(300, None).unwrap();
    assert!(report.candidates_tried > 0);

    let denylist = Denylist::default();
    let scope = prober.into_transport();
    for command in scope
        .sent
        .iter()
        .filter(|c| *c != ERROR_QUERY && *c != CLEAR_STATUS)
    {
        assert!(!denylist.blocks(command), "sent destructive command {}", command);
        assert!(command.contains('?'), "fuzz sent a set command {}", command);
    }
}

#[test]
fn test_fuzz_is_reproducible_with_seed() {
    let run = || {
        let (_dir, config) = setup(&[":CHANnel1:SCALe?", ":TIMebase:SCALe?", ":MATH1:DISPlay?"]);
        let scope = ScriptedScope::new(&[]).answering_everything();
        let mut prober = Prober::new(
            scope,
            ProbeConfig {
                seed: Some(99),
                ..config
            },
        );
        prober.run_fuzz(30, None).unwrap();
        prober.into_transport().sent
    };
    assert_eq!(run(), run());
}
