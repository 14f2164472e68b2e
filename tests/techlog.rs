//! Tech-log rotation scenarios over real files.

use std::io::Write;
use std::path::Path;

use file_tail::{archive, FileTailer, ReadFrom, Rotation, TailState};

use onec_ingest::model::SourceIdentity;
use onec_ingest::techlog::{hour_from_filename, parse_record, LineAssembler};

fn write_file(path: &Path, contents: &str) {
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f.sync_all().unwrap();
}

/// Drive the tailer + assembler and return completed raw records.
fn drain(tailer: &mut FileTailer, assembler: &mut LineAssembler) -> Vec<String> {
    let mut completed = Vec::new();
    while let Some(line) = tailer.read_line().unwrap() {
        let text = String::from_utf8_lossy(&line.bytes).into_owned();
        if let Some(record) = assembler.push(&text) {
            completed.push(record);
        }
    }
    completed
}

#[test]
fn replacement_mid_read_loses_nothing_and_repeats_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025111310.log");
    write_file(
        &path,
        "41:17.112004-25023,DBMSSQL,2,process=rphost,Sql='SELECT 1'\n\
         41:18.000001-10,CALL,1,CallID=1\n\
         41:19.000001-10,CALL,1,CallID=2\n",
    );

    let mut tailer = FileTailer::open(path.clone(), ReadFrom::Beginning, 1 << 20).unwrap();
    let mut assembler = LineAssembler::new();
    let mut seen = drain(&mut tailer, &mut assembler);
    // Two records completed; the third waits for a successor line.
    assert_eq!(seen.len(), 2);

    // The platform swaps in a new file under the same name: different
    // inode, smaller size.
    std::fs::remove_file(&path).unwrap();
    write_file(&path, "42:00.000001-5,CONN,0,Txt=new connection\n");

    assert_eq!(tailer.check_rotation().unwrap(), Rotation::Replaced);
    assert_eq!(tailer.state(), TailState::RotatedOut);

    // The record still pending in the assembler belonged to the old
    // generation and is complete at the boundary.
    if let Some(last) = assembler.finish() {
        seen.push(last);
    }
    assert_eq!(seen.len(), 3);

    tailer.rotate().unwrap();
    seen.extend(drain(&mut tailer, &mut assembler));
    if let Some(last) = assembler.finish() {
        seen.push(last);
    }

    // Every record exactly once, across both generations.
    assert_eq!(seen.len(), 4);
    let unique: std::collections::HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), 4);
    assert!(seen[3].starts_with("42:00.000001-5,CONN"));
}

#[test]
fn records_parse_with_filename_hour_across_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025111310.log");
    write_file(
        &path,
        "05:00.000001-42,EXCP,1,Descr='multi\nline failure',Usr=jdoe\n\
         06:00.000001-1,CALL,1,CallID=7\n",
    );

    let hour = hour_from_filename("2025111310.log").unwrap();
    let identity = SourceIdentity::default();
    let mut tailer = FileTailer::open(path, ReadFrom::Beginning, 1 << 20).unwrap();
    let mut assembler = LineAssembler::new();

    let mut records = Vec::new();
    for raw in drain(&mut tailer, &mut assembler) {
        records.push(parse_record(hour, &raw, &identity, "rphost_2012").unwrap());
    }
    if let Some(raw) = assembler.finish() {
        records.push(parse_record(hour, &raw, &identity, "rphost_2012").unwrap());
    }

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].name, "EXCP");
    assert_eq!(records[0].ts.to_rfc3339(), "2025-11-13T10:05:00.000001+00:00");
    assert_eq!(
        records[0].exception.descr.as_deref(),
        Some("multi\nline failure")
    );
    assert_eq!(records[1].name, "CALL");
    assert_eq!(records[1].session.call_id, Some(7));
}

#[test]
fn archive_resumes_from_the_live_files_line_count() {
    let dir = tempfile::tempdir().unwrap();
    let zip_path = dir.path().join("2025111310.log.zip");

    let contents = "41:17.000001-1,CALL,1,CallID=1\n\
                    41:18.000001-1,CALL,1,CallID=2\n\
                    41:19.000001-1,CALL,1,CallID=3\n";
    let file = std::fs::File::create(&zip_path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("2025111310.log", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(contents.as_bytes()).unwrap();
    writer.finish().unwrap();

    // Two lines were already ingested while the file was live; the
    // archive drain must deliver only the remainder.
    let mut assembler = LineAssembler::new();
    let mut delivered = Vec::new();
    let total = archive::for_each_line(&zip_path, 2, |_, bytes| {
        if let Some(record) = assembler.push(&String::from_utf8_lossy(bytes)) {
            delivered.push(record);
        }
    })
    .unwrap();
    if let Some(last) = assembler.finish() {
        delivered.push(last);
    }

    assert_eq!(total, 3);
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].contains("CallID=3"));
}
