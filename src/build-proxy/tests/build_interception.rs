//! Integration test: intercept a multi-stage build end to end.
//!
//! 1. Build a gzip-compressed build context with a two-stage Dockerfile
//! 2. Rewrite it with directory-based overrides
//! 3. Check the rewritten archive contents
//! 4. Feed engine-style build output for the rewritten Dockerfile through
//!    the output pipeline and check what the user would see
//!
//! ## Running
//!
//! ```bash
//! cargo test -p a3s-box-build-proxy --test build_interception
//! ```

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use a3s_box_build_proxy::output::INTERCEPTION_NOTICE;
use a3s_box_build_proxy::{
    build_output_pipeline, BuildContextInjector, DirectoryOverrides, DockerHostResolver,
    StandardProxyEnv,
};
use a3s_box_core::log::BuildLogRecord;
use a3s_box_core::BuildProxyConfig;
use flate2::write::GzEncoder;
use flate2::Compression;

const DOCKERFILE: &str = "\
# syntax=docker/dockerfile:1
FROM golang:1.22 AS builder
WORKDIR /src
RUN go build -o /out/app .

FROM alpine:3.19
COPY --from=builder /out/app /usr/local/bin/app
CMD [\"app\"]
";

const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBtest\n-----END CERTIFICATE-----\n";

fn gzip_context() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in [("main.go", "package main\n"), ("Dockerfile", DOCKERFILE)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data.as_bytes()).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

fn read_entries(data: &[u8]) -> Vec<(String, String)> {
    let mut archive = tar::Archive::new(data);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            (path, body)
        })
        .collect()
}

/// Engine output for a Dockerfile, the way the classic builder prints it.
fn engine_output(dockerfile: &str) -> Vec<String> {
    let instructions: Vec<&str> = dockerfile
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .collect();

    let mut records = Vec::new();
    for (i, instruction) in instructions.iter().enumerate() {
        let stream = format!("Step {}/{} : {}\n", i + 1, instructions.len(), instruction);
        records.push(stream);
        if instruction.starts_with("RUN") {
            records.push(format!(" ---> Running in {:04x}\n", i));
            records.push("building...\n".to_string());
            records.push(format!("Removing intermediate container {:04x}\n", i));
        }
        records.push(format!(" ---> {:08x}\n", 0xabc000 + i));
    }
    records.push("Successfully built 00abc00f\n".to_string());

    records
        .into_iter()
        .map(|stream| BuildLogRecord::from_stream(stream).to_json_line().unwrap())
        .collect()
}

#[tokio::test]
async fn test_multi_stage_build_interception() {
    let overrides = tempfile::TempDir::new().unwrap();
    std::fs::write(overrides.path().join("gitconfig"), "[http]\n\tsslVerify = true\n").unwrap();

    let injector = Arc::new(BuildContextInjector::new(
        StandardProxyEnv,
        DockerHostResolver,
        DirectoryOverrides::new(overrides.path()),
    ));
    let config = BuildProxyConfig::new(8123, CERT);
    let stream = injector.spawn(
        config.dockerfile.clone(),
        Cursor::new(gzip_context()),
        Vec::new(),
        config,
    );

    let extra = stream.commands_added.resolved().await.unwrap();
    let output = stream.task.await.unwrap().unwrap();

    // 2 stages x (LABEL, COPY, ENV, LABEL)
    assert_eq!(extra, 8);

    let entries = read_entries(&output);
    let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(&paths[..3], &["main.go", "Dockerfile", ".a3s-box-injections/ca.pem"]);
    assert!(paths.contains(&".a3s-box-injections/overrides/gitconfig"));
    assert_eq!(entries[0].1, "package main\n");
    assert_eq!(entries[2].1, CERT);

    let dockerfile = &entries[1].1;
    assert!(dockerfile.starts_with("# syntax=docker/dockerfile:1\nFROM golang:1.22 AS builder\nLABEL "));
    assert!(dockerfile.contains("COPY --from=builder /out/app /usr/local/bin/app\nCMD [\"app\"]\n"));
    assert_eq!(dockerfile.matches("started-8123").count(), 2);
    assert!(!dockerfile.contains("DOCKER_HOST"));

    // Build output for the rewritten Dockerfile, filtered back to the user's view
    let raw_output = engine_output(dockerfile).join("\n");
    let mut filtered = Vec::new();
    build_output_pipeline(extra)
        .pipe(raw_output.as_bytes(), &mut filtered)
        .await
        .unwrap();

    let visible: Vec<String> = String::from_utf8(filtered)
        .unwrap()
        .lines()
        .map(|line| BuildLogRecord::parse(line).unwrap().stream.unwrap())
        .collect();

    let steps: Vec<&str> = visible
        .iter()
        .filter(|s| s.starts_with("Step "))
        .map(String::as_str)
        .collect();
    assert_eq!(
        steps,
        vec![
            "Step 1/6 : FROM golang:1.22 AS builder\n",
            "Step 2/6 : WORKDIR /src\n",
            "Step 3/6 : RUN go build -o /out/app .\n",
            "Step 4/6 : FROM alpine:3.19\n",
            "Step 5/6 : COPY --from=builder /out/app /usr/local/bin/app\n",
            "Step 6/6 : CMD [\"app\"]\n",
        ]
    );
    assert_eq!(
        visible.iter().filter(|s| s.as_str() == INTERCEPTION_NOTICE).count(),
        2
    );
    assert!(visible.iter().all(|s| !s.contains("io.a3s.box.build-proxy")));
    assert!(visible.iter().any(|s| s == "building...\n"));
    assert_eq!(visible.last().unwrap(), "Successfully built 00abc00f\n");
}
