/// One slice of a bulk reply. Packets are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_packets: usize,
    pub current_packet: usize,
}

/// `ceil(items / bucket)`, never less than 1 so an empty reply still
/// produces a packet the receiver can count.
pub fn packet_count(items: usize, bucket: usize) -> usize {
    let bucket = bucket.max(1);
    items.div_ceil(bucket).max(1)
}

pub fn paginate<T>(items: Vec<T>, bucket: usize) -> Vec<Page<T>> {
    let bucket = bucket.max(1);
    let total_packets = packet_count(items.len(), bucket);
    let mut pages = Vec::with_capacity(total_packets);
    let mut iter = items.into_iter().peekable();
    for current_packet in 1..=total_packets {
        let chunk: Vec<T> = iter.by_ref().take(bucket).collect();
        pages.push(Page {
            items: chunk,
            total_packets,
            current_packet,
        });
    }
    debug_assert!(iter.peek().is_none());
    pages
}
