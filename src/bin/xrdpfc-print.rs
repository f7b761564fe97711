#![deny(unsafe_code)]

//! Inspects proxy-file-cache `cinfo` sidecars.
//!
//! Usage: `xrdpfc-print [--json] <file.cinfo>...`

use std::io::Write;
use std::process::ExitCode;

use xrd_cache::CInfo;

fn main() -> ExitCode {
    xrd_core::env::init_tracing();
    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr().lock();
    run_with(std::env::args().skip(1), &mut stdout, &mut stderr)
}

fn run_with<I, Out, Err>(args: I, stdout: &mut Out, stderr: &mut Err) -> ExitCode
where
    I: IntoIterator<Item = String>,
    Out: Write,
    Err: Write,
{
    let mut json = false;
    let mut paths = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            "--help" | "-h" => {
                let _ = writeln!(stdout, "usage: xrdpfc-print [--json] <file.cinfo>...");
                return ExitCode::SUCCESS;
            }
            _ => paths.push(arg),
        }
    }
    if paths.is_empty() {
        let _ = writeln!(stderr, "xrdpfc-print: no cinfo files given");
        return ExitCode::FAILURE;
    }

    let mut failed = false;
    for path in &paths {
        match print_one(path, json, stdout) {
            Ok(()) => {}
            Err(reason) => {
                let _ = writeln!(stderr, "xrdpfc-print: {path}: {reason}");
                failed = true;
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_one<Out: Write>(path: &str, json: bool, out: &mut Out) -> Result<(), String> {
    let bytes = std::fs::read(path).map_err(|err| err.to_string())?;
    let info = CInfo::deserialize(&bytes)?;

    if json {
        let value = serde_json::json!({
            "path": path,
            "block_size": info.block_size(),
            "file_size": info.file_size(),
            "creation_time": info.creation_time(),
            "cksum_state": info.cksum_state(),
            "n_blocks": info.n_blocks(),
            "blocks_present": info.bits_set(),
            "complete": info.is_complete(),
            "accesses": info.accesses(),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?)
            .map_err(|err| err.to_string())?;
        return Ok(());
    }

    let percent = if info.n_blocks() == 0 {
        100.0
    } else {
        100.0 * info.bits_set() as f64 / info.n_blocks() as f64
    };
    writeln!(out, "{path}:").map_err(|err| err.to_string())?;
    writeln!(
        out,
        "  block size {} B, file size {} B, created {}",
        info.block_size(),
        info.file_size(),
        info.creation_time()
    )
    .map_err(|err| err.to_string())?;
    writeln!(
        out,
        "  blocks {}/{} present ({percent:.1}%), checksum {:?}",
        info.bits_set(),
        info.n_blocks(),
        info.cksum_state()
    )
    .map_err(|err| err.to_string())?;
    for (index, access) in info.accesses().iter().enumerate() {
        writeln!(
            out,
            "  access[{index}] attach {} detach {} ios {} hit {} missed {} bypassed {}",
            access.attach_time,
            access.detach_time,
            access.num_ios,
            access.bytes_hit,
            access.bytes_missed,
            access.bytes_bypassed
        )
        .map_err(|err| err.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::run_with;
    use std::process::ExitCode;
    use xrd_cache::cinfo::{AccessRecord, CInfo};

    fn sample_sidecar(dir: &tempfile::TempDir) -> String {
        let mut info = CInfo::new(1 << 20, 3 << 20, 1_700_000_000);
        info.set_bit(0);
        info.set_bit(2);
        info.record_access(AccessRecord {
            attach_time: 1_700_000_100,
            detach_time: 1_700_000_200,
            num_ios: 5,
            bytes_hit: 1024,
            bytes_missed: 2048,
            ..AccessRecord::default()
        });
        let path = dir.path().join("f.cinfo");
        std::fs::write(&path, info.serialize()).expect("write sidecar");
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn text_output_summarizes_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_sidecar(&dir);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = run_with([path], &mut stdout, &mut stderr);
        assert_eq!(exit, ExitCode::SUCCESS);

        let text = String::from_utf8(stdout).unwrap();
        assert!(text.contains("blocks 2/3 present"));
        assert!(text.contains("access[0]"));
        assert!(stderr.is_empty());
    }

    #[test]
    fn json_output_parses_and_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_sidecar(&dir);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = run_with(["--json".to_owned(), path], &mut stdout, &mut stderr);
        assert_eq!(exit, ExitCode::SUCCESS);

        let value: serde_json::Value = serde_json::from_slice(&stdout).unwrap();
        assert_eq!(value["n_blocks"], 3);
        assert_eq!(value["blocks_present"], 2);
        assert_eq!(value["complete"], false);
        assert_eq!(value["accesses"][0]["num_ios"], 5);
    }

    #[test]
    fn unreadable_sidecar_fails_with_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.cinfo");
        std::fs::write(&bogus, b"nonsense").unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = run_with(
            [bogus.to_string_lossy().into_owned()],
            &mut stdout,
            &mut stderr,
        );
        assert_eq!(exit, ExitCode::FAILURE);
        assert!(!stderr.is_empty());
    }

    #[test]
    fn no_arguments_is_an_error() {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = run_with(Vec::<String>::new(), &mut stdout, &mut stderr);
        assert_eq!(exit, ExitCode::FAILURE);
    }
}
