use crate::protocol::ChunkResult;

/// Concatenate chunk transcripts in source order.
///
/// A single chunk is returned verbatim. With more than one chunk each trimmed text is
/// prefixed with a `[Chunk i/n]` marker and chunks are separated by a blank line.
pub fn merge_transcripts(mut results: Vec<ChunkResult>) -> String {
    results.sort_by_key(|result| result.index);

    let total = results.len();
    if total == 1 {
        return results.remove(0).text;
    }

    results
        .iter()
        .enumerate()
        .map(|(position, result)| {
            format!("[Chunk {}/{}]\n{}", position + 1, total, result.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
