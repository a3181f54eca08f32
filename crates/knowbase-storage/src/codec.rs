//! Little-endian float32 array codec for the `embedding BLOB` column
//! (spec §6: "little-endian float32 array, length = 4·dim").

pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_float_vector_when_roundtripped_then_values_are_preserved() {
        let values = vec![0.5f32, -1.25, 0.0, 3.75];
        let decoded = decode_embedding(&encode_embedding(&values));
        assert_eq!(decoded, values);
    }
}
