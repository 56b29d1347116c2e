//! In-process seeder used by the download tests

use std::path::Path;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::peer::PeerConnection;
use crate::protocol::Message;
use crate::storage::{DiskWriter, PieceStore};
use crate::torrent::FileEntry;

const SEEDER_ID: [u8; 20] = *b"-SD0001-seederseeder";

/// A single-file torrent with generated content
pub struct TestTorrent {
    pub data: Vec<u8>,
    pub piece_length: usize,
    pub hashes: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
}

impl TestTorrent {
    pub fn new(piece_length: usize, total: usize) -> Self {
        let data: Vec<u8> = (0..total).map(|i| (i * 31 % 251) as u8).collect();
        let hashes = data
            .chunks(piece_length)
            .map(|chunk| -> [u8; 20] { Sha1::digest(chunk).into() })
            .collect();
        Self {
            data,
            piece_length,
            hashes,
            info_hash: [0x42; 20],
        }
    }

    pub fn store(&self) -> PieceStore {
        PieceStore::new(self.hashes.clone(), self.piece_length as u64, self.data.len() as u64)
    }

    pub async fn disk(&self, root: &Path) -> DiskWriter {
        let entry = FileEntry {
            path: "payload.bin".into(),
            length: self.data.len() as u64,
            offset: 0,
        };
        DiskWriter::new(root, vec![entry], self.piece_length as u64, self.data.len() as u64)
            .await
            .unwrap()
    }
}

/// Behaviour of the fake remote peer
#[derive(Clone)]
pub struct Seeder {
    data: Arc<Vec<u8>>,
    piece_length: usize,
    piece_count: usize,
    info_hash: [u8; 20],
    /// Send unchoke after the bitfield
    pub unchoke: bool,
    /// Flip a byte the first time this piece is served
    pub corrupt_first: Option<usize>,
    /// Hang up when a request arrives after this many blocks were served
    pub hang_up_after: Option<usize>,
}

impl Seeder {
    pub fn new(torrent: &TestTorrent) -> Self {
        Self {
            data: Arc::new(torrent.data.clone()),
            piece_length: torrent.piece_length,
            piece_count: torrent.hashes.len(),
            info_hash: torrent.info_hash,
            unchoke: true,
            corrupt_first: None,
            hang_up_after: None,
        }
    }

    fn full_bitfield(&self) -> Vec<u8> {
        let mut bitfield = vec![0u8; self.piece_count.div_ceil(8)];
        for index in 0..self.piece_count {
            bitfield[index / 8] |= 0x80 >> (index % 8);
        }
        bitfield
    }
}

/// Seed over one stream until the other side goes away
pub async fn serve<S>(stream: S, seeder: Seeder)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(mut conn) = PeerConnection::handshake(stream, seeder.info_hash, SEEDER_ID).await else {
        return;
    };

    let bitfield = seeder.full_bitfield();
    if conn.send_message(Message::Bitfield { bitfield }).await.is_err() {
        return;
    }
    if seeder.unchoke && conn.send_message(Message::Unchoke).await.is_err() {
        return;
    }

    let mut served = 0;
    let mut corrupted = false;
    loop {
        let (index, begin, length) = match conn.read_message().await {
            Ok(Some(Message::Request { index, begin, length })) => (index, begin, length),
            Ok(_) => continue,
            Err(_) => return,
        };
        if seeder.hang_up_after == Some(served) {
            return;
        }

        let start = index as usize * seeder.piece_length + begin as usize;
        let Some(slice) = seeder.data.get(start..start + length as usize) else {
            return;
        };
        let mut block = slice.to_vec();
        if seeder.corrupt_first == Some(index as usize) && !corrupted {
            block[0] ^= 0xff;
            corrupted = true;
        }

        if conn.send_message(Message::Piece { index, begin, block }).await.is_err() {
            return;
        }
        served += 1;
    }
}

/// Accept connections forever, seeding each one
pub async fn seed_on(listener: TcpListener, seeder: Seeder) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, seeder.clone()));
    }
}
