//! End-to-end tests: the built stub is copied, a payload and footer are
//! appended to it, and the resulting artifact is executed.

mod artifact_tests {
    use std::{
        fs, io,
        path::{Path, PathBuf},
        process::{Command, Output},
        thread::sleep,
        time::Duration,
    };

    use assert_cmd::prelude::*;
    use flate2::{write::GzEncoder, Compression};
    use predicates::prelude::*;
    use tar::{Builder, EntryType, Header};
    use tempfile::TempDir;

    const STUB: &str = env!("CARGO_BIN_EXE_caxa-stub");
    const SEPARATOR: &[u8] = b"\nCAXACAXACAXA\n";

    const APP_SCRIPT: &[u8] = b"#!/bin/sh\nprintf '%s\\n' \"$0\" \"$@\"\nexit 3\n";

    struct Bundle {
        temp: TempDir,
        artifact: PathBuf,
    }

    impl Bundle {
        fn new(payload: &[u8], footer: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let artifact = temp.path().join("bundle");
            let mut data = fs::read(STUB).unwrap();
            data.extend_from_slice(SEPARATOR);
            data.extend_from_slice(payload);
            data.push(b'\n');
            data.extend_from_slice(footer.as_bytes());
            fs::write(&artifact, data).unwrap();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&artifact, fs::Permissions::from_mode(0o755)).unwrap();
            }
            Bundle { temp, artifact }
        }

        fn cache(&self) -> PathBuf {
            self.temp.path().join("cache")
        }

        fn run(&self, args: &[&str]) -> Output {
            let mut cmd = Command::new(&self.artifact);
            cmd.args(args)
                .env("CAXA_TEMP_DIR", self.cache())
                .env_remove("CAXA_LOG");
            spawn_retrying(&mut cmd)
        }
    }

    /// Parallel tests fork while other artifacts are still open for writing,
    /// which makes exec fail with ETXTBSY for a short window.
    fn spawn_retrying(cmd: &mut Command) -> Output {
        let mut tries = 0;
        loop {
            match cmd.output() {
                Err(err) if err.raw_os_error() == Some(26) && tries < 50 => {
                    tries += 1;
                    sleep(Duration::from_millis(20));
                }
                result => return result.unwrap(),
            }
        }
    }

    fn targz(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        build(&mut builder);
        let tar = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        io::Write::write_all(&mut encoder, &tar).unwrap();
        encoder.finish().unwrap()
    }

    fn append(builder: &mut Builder<Vec<u8>>, name: &str, kind: EntryType, data: &[u8], mode: u32) {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn demo_payload() -> Vec<u8> {
        targz(|b| {
            append(b, "bin/app", EntryType::Regular, APP_SCRIPT, 0o755);
            append(b, "data", EntryType::Directory, b"", 0o755);
        })
    }

    fn app_dir(cache: &Path, attempt: u32) -> PathBuf {
        cache.join("apps").join("demo").join(attempt.to_string())
    }

    #[cfg(unix)]
    #[test]
    fn launches_bundled_app_with_forwarded_args() {
        let bundle = Bundle::new(
            &demo_payload(),
            r#"{"identifier":"demo","command":["{{caxa}}/bin/app","--flag"]}"#,
        );
        let staged = app_dir(&bundle.cache(), 0);
        let expected = format!("{}/bin/app\n--flag\nx\n", staged.display());

        bundle.run(&["x"])
            .assert()
            .code(3)
            .stdout(expected.clone());

        assert!(staged.join("data").is_dir());
        assert!(!bundle.cache().join("locks/demo/0").exists());

        // second launch reuses the same slot
        bundle.run(&["x"])
            .assert()
            .code(3)
            .stdout(expected);
        assert!(!app_dir(&bundle.cache(), 1).exists());
    }

    #[cfg(unix)]
    #[test]
    fn preserves_file_modes() {
        use std::os::unix::fs::PermissionsExt;

        let bundle = Bundle::new(
            &demo_payload(),
            r#"{"identifier":"demo","command":["{{caxa}}/bin/app"]}"#,
        );
        bundle.run(&[]).assert().code(3);
        let mode = fs::metadata(app_dir(&bundle.cache(), 0).join("bin/app"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn uncompression_message_only_on_extraction() {
        let bundle = Bundle::new(
            &demo_payload(),
            r#"{"identifier":"demo","command":["{{ caxa }}/bin/app"],"uncompressionMessage":"Unpacking demo"}"#,
        );
        bundle.run(&[])
            .assert()
            .code(3)
            .stderr(predicate::str::starts_with("Unpacking demo"));
        bundle.run(&[])
            .assert()
            .code(3)
            .stderr(predicate::str::contains("Unpacking demo").not());
    }

    #[cfg(unix)]
    #[test]
    fn forwarded_args_can_supply_whole_command() {
        let bundle = Bundle::new(&demo_payload(), r#"{"identifier":"demo","command":[]}"#);
        bundle.run(&["sh", "-c", "exit 5"]).assert().code(5);
    }

    #[test]
    fn empty_command_is_fatal() {
        let bundle = Bundle::new(&demo_payload(), r#"{"identifier":"demo","command":[]}"#);
        bundle.run(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("caxa: execution failed: no command defined"));
    }

    #[test]
    fn bare_stub_is_corrupt() {
        let mut cmd = Command::new(STUB);
        cmd.env_remove("CAXA_LOG");
        spawn_retrying(&mut cmd)
            .assert()
            .failure()
            .stderr(predicate::str::contains("caxa: binary corrupted"));
    }

    #[test]
    fn invalid_footer_is_corrupt() {
        let bundle = Bundle::new(&demo_payload(), r#"{"identifier":"demo"}"#);
        bundle.run(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("caxa: binary corrupted: invalid footer json"));
        assert!(!bundle.cache().exists());
    }

    #[test]
    fn traversal_payload_is_rejected_and_cleaned() {
        let payload = targz(|b| {
            let mut header = Header::new_gnu();
            let name = b"../../../../escape.txt";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_entry_type(EntryType::Regular);
            header.set_size(1);
            header.set_mode(0o644);
            header.set_cksum();
            b.append(&header, &b"x"[..]).unwrap();
        });
        let bundle = Bundle::new(&payload, r#"{"identifier":"demo","command":["true"]}"#);
        bundle.run(&[])
            .assert()
            .failure()
            .stderr(predicate::str::contains("illegal file path"));

        assert!(!app_dir(&bundle.cache(), 0).exists());
        assert!(!bundle.cache().join("locks/demo/0").exists());
        assert!(!bundle.temp.path().join("escape.txt").exists());
    }
}
