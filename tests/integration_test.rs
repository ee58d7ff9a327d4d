use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use tempfile::NamedTempFile;
use xorpeel::xor::merge_in_place;
use xorpeel::{
    write_frame, DecodeError, DecodeSession, Frame, PeelingDecoder, SessionError, SessionOptions,
};

/// Split `data` into zero-padded blocks of `block_size` bytes.
fn source_blocks(data: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    data.chunks(block_size)
        .map(|c| {
            let mut b = c.to_vec();
            b.resize(block_size, 0);
            b
        })
        .collect()
}

fn combine(blocks: &[Vec<u8>], ids: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; blocks[0].len()];
    for &id in ids {
        merge_in_place(&mut out, &blocks[id as usize]);
    }
    out
}

/// Random-degree frames: mostly degree 2-4, with a few singletons to seed
/// the peeling process.
fn random_frames(data: &[u8], block_size: usize, count: usize, seed: u64) -> Vec<Frame> {
    let blocks = source_blocks(data, block_size);
    let k = blocks.len() as u32;
    let mut rng = StdRng::seed_from_u64(seed);
    let ids: Vec<u32> = (0..k).collect();
    (0..count)
        .map(|_| {
            let degree = if rng.random_bool(0.2) { 1 } else { rng.random_range(2..=4.min(k as usize)) };
            let deps: Vec<u32> = ids.choose_multiple(&mut rng, degree).copied().collect();
            Frame::new(data.len() as u32, deps.clone(), combine(&blocks, &deps))
        })
        .collect()
}

#[test]
fn test_three_block_scenario() {
    let mut dec = PeelingDecoder::new(3);
    assert!(!dec.add_block(&[1, 2], vec![0x01, 0x02, 0x03, 0x04]).unwrap());
    assert!(!dec.add_block(&[0, 2], vec![0x05, 0x06, 0x07, 0x08]).unwrap());
    assert!(dec.add_block(&[2], vec![0x0A, 0x0B, 0x0C, 0x0D]).unwrap());

    let out: Vec<Vec<u8>> = dec.sequence().map(|p| p.to_vec()).collect();
    assert_eq!(out, vec![
        vec![0x0F, 0x0D, 0x0B, 0x05],
        vec![0x0B, 0x09, 0x0F, 0x09],
        vec![0x0A, 0x0B, 0x0C, 0x0D],
    ]);
}

#[test]
fn test_cascade_xor_correctness() {
    let x = vec![0xDE, 0xAD, 0xBE, 0xEF];
    let y = vec![0x12, 0x34, 0x56, 0x78];
    let mut dec = PeelingDecoder::new(2);
    dec.add_block(&[0, 1], x.clone()).unwrap();
    assert!(dec.add_block(&[1], y.clone()).unwrap());
    assert_eq!(dec.get(1), Some(y.as_slice()));
    let expected: Vec<u8> = x.iter().zip(&y).map(|(a, b)| a ^ b).collect();
    assert_eq!(dec.get(0), Some(expected.as_slice()));
}

#[test]
fn test_random_stream_recovers_source() {
    let data: Vec<u8> = (0..4000u32).map(|i| (i * 31 % 251) as u8).collect();
    let frames = random_frames(&data, 64, 600, 7);

    let mut dec = PeelingDecoder::with_block_len(63, 64);
    let mut done = false;
    for f in &frames {
        let now = dec.add_block(&f.dependencies, f.payload.clone()).unwrap();
        assert!(!done || now, "completion must be sticky");
        done = now;
    }
    assert!(done, "600 frames should cover 63 source blocks");

    let mut recovered: Vec<u8> = dec.sequence().flatten().copied().collect();
    recovered.truncate(data.len());
    assert_eq!(recovered, data);
}

#[test]
fn test_invalid_block_leaves_state_untouched() {
    let mut dec = PeelingDecoder::with_block_len(4, 2);
    dec.add_block(&[0, 1], vec![1, 2]).unwrap();
    let before = dec.stats();
    assert_eq!(dec.add_block(&[2, 2], vec![0, 0]), Err(DecodeError::DuplicateId { id: 2 }));
    assert_eq!(dec.add_block(&[9], vec![0, 0]), Err(DecodeError::IdOutOfRange { id: 9, k: 4 }));
    assert_eq!(dec.stats(), before);
    assert_eq!(dec.pending_count(), 1);
}

#[test]
fn test_session_file_roundtrip() {
    let data: Vec<u8> = b"The quick brown fox jumps over the lazy dog. ".repeat(40);
    let mut frames = random_frames(&data, 32, 300, 11);
    frames.shuffle(&mut StdRng::seed_from_u64(3));

    let stream_file = NamedTempFile::new().unwrap();
    {
        let mut w = BufWriter::new(File::create(stream_file.path()).unwrap());
        for f in &frames {
            write_frame(&mut w, f).unwrap();
        }
        w.flush().unwrap();
    }

    let mut session = DecodeSession::new(SessionOptions::default()).unwrap();
    let reader = BufReader::new(File::open(stream_file.path()).unwrap());
    assert!(session.run(reader).unwrap());

    let out_file = NamedTempFile::new().unwrap();
    let n = session.save_output(out_file.path()).unwrap();
    assert_eq!(n, data.len() as u64);
    assert_eq!(std::fs::read(out_file.path()).unwrap(), data);

    let stats = session.stats();
    assert!(stats.frames_processed <= frames.len() as u64);
    assert!(stats.code_rate > 0.0 && stats.code_rate <= 1.0);
    assert_eq!(stats.output_blake3.unwrap(), blake3::hash(&data).to_hex().to_string());
}

#[test]
fn test_stalled_session_keeps_existing_output() {
    let data = [5u8; 12];
    let blocks = source_blocks(&data, 4);
    let mut stream = Vec::new();
    write_frame(&mut stream, &Frame::new(12, vec![0], blocks[0].clone())).unwrap();

    let mut session = DecodeSession::new(SessionOptions::default()).unwrap();
    assert!(!session.run(&stream[..]).unwrap());

    let out_file = NamedTempFile::new().unwrap();
    std::fs::write(out_file.path(), b"PRECIOUS").unwrap();
    let err = session.save_output(out_file.path()).unwrap_err();
    assert!(matches!(err, SessionError::Stalled { frames_processed: 1, resolved: 1, k: 3 }));
    assert_eq!(std::fs::read(out_file.path()).unwrap(), b"PRECIOUS");
}

#[test]
fn test_session_with_losses_and_json_stats() {
    let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
    let frames = random_frames(&data, 128, 200, 5);
    let opts = SessionOptions { drop_rate: 0.3, seed: Some(99), max_blocks: None };

    let mut session = DecodeSession::new(opts).unwrap();
    for f in frames {
        if session.handle_frame(f).unwrap() {
            break;
        }
    }
    assert!(session.is_complete());
    assert_eq!(session.reassemble().unwrap(), data);

    let stats = session.stats();
    assert!(stats.frames_dropped > 0);
    let json: serde_json::Value = serde_json::from_slice(&stats.to_json().unwrap()).unwrap();
    assert_eq!(json["complete"], true);
    assert_eq!(json["source_blocks"], 16);
    assert_eq!(
        json["frames_received"].as_u64().unwrap(),
        stats.frames_dropped + stats.frames_processed,
    );
}

#[test]
fn test_options_file_loads() {
    let mut cfg = NamedTempFile::new().unwrap();
    cfg.write_all(br#"{ "drop_rate": 0.05, "max_blocks": 1000 }"#).unwrap();
    let opts = SessionOptions::load(cfg.path()).unwrap();
    assert_eq!(opts.max_blocks, Some(1000));
    assert_eq!(opts.seed, None);
}
