use std::{
    collections::BTreeSet,
    fs,
    io::{Cursor, Read},
    time::Duration,
};

use csv::{ReaderBuilder, StringRecord};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use reqwest::Client;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use zip::ZipArchive;

use super::{
    Error, Result,
    cidr::{CidrBlock, coalesce, summarize},
    option::{DatasetOption, NetworkOption},
    source::CountryCode,
};

/// Upper bound of the decompressed data file, guards against archive bombs
const MAX_DATA_SIZE: u64 = 1 << 30;

/// Number of skipped records logged individually
const MAX_LOGGED_SKIPS: usize = 10;

/// One dataset row: an inclusive address interval and its country
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpRange {
    pub start: u32,
    pub end: u32,
    pub country: CountryCode,
}

/// Outcome of parsing the dataset
#[derive(Debug, Default)]
pub struct ParsedDataset {
    pub ranges: Vec<IpRange>,
    /// Number of records skipped as malformed
    pub malformed: usize,
}

impl ParsedDataset {
    /// Minimal blocks covering every range of the selected countries
    pub fn blocks_for(&self, countries: &BTreeSet<CountryCode>) -> Vec<CidrBlock> {
        if countries.is_empty() {
            return Vec::new();
        }
        let intervals = self
            .ranges
            .iter()
            .filter(|range| countries.contains(&range.country))
            .map(|range| (range.start, range.end));

        coalesce(intervals)
            .into_iter()
            .flat_map(|(start, end)| summarize(start, end))
            .collect()
    }
}

/// Downloads and parses the IP-to-country dataset
pub struct Acquirer {
    option: DatasetOption,
    network: NetworkOption,
    client: Client,
}

impl Acquirer {
    pub fn new(option: &DatasetOption, network: &NetworkOption) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(option.timeout))
            .user_agent(format!("geoblock/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Acquirer {
            option: option.clone(),
            network: network.clone(),
            client,
        })
    }

    /// Confirm outbound reachability, retrying with bounded exponential backoff
    pub async fn check_connectivity(&self) -> Result<()> {
        let Some(probe) = self.network.probe() else {
            debug!("CONNECTIVITY CHECK DISABLED");
            return Ok(());
        };
        let connect_timeout = Duration::from_millis(self.network.connect_timeout);

        let mut attempt = 0;
        loop {
            match timeout(connect_timeout, TcpStream::connect(probe)).await {
                Ok(Ok(_)) => {
                    info!("CONNECTIVITY [{}] OK", probe);
                    return Ok(());
                }
                Ok(Err(e)) => warn!("CONNECTIVITY [{}] FAILED: {}", probe, e),
                Err(_) => warn!("CONNECTIVITY [{}] TIMED OUT", probe),
            }

            if attempt >= self.network.max_retries {
                return Err(Error::NetworkUnavailable(format!(
                    "{} unreachable after {} attempts",
                    probe,
                    attempt + 1
                )));
            }
            attempt += 1;

            let delay = self.network.delay(attempt);
            info!(
                "RETRY CONNECTIVITY [{}/{}] IN [{}ms]",
                attempt,
                self.network.max_retries,
                delay.as_millis()
            );
            sleep(delay).await;
        }
    }

    /// Get the raw archive, from the local path if configured, else over HTTP
    pub async fn fetch(&self) -> Result<Vec<u8>> {
        if let Some(path) = &self.option.path {
            info!("READ DATASET [{}]", path.display());
            let mut data = Vec::new();
            fs::File::open(path)?
                .take(self.option.max_size + 1)
                .read_to_end(&mut data)?;
            self.check_size(data.len() as u64)?;
            return Ok(data);
        }

        info!("DOWNLOAD DATASET [{}]", self.option.url);
        let response = self
            .client
            .get(&self.option.url)
            .send()
            .await
            .map_err(|e| Error::NetworkUnavailable(format!("Download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::NetworkUnavailable(format!(
                "Download failed: HTTP {} from {}",
                response.status(),
                self.option.url
            )));
        }
        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::NetworkUnavailable(format!("Download interrupted: {}", e)))?;
        self.check_size(bytes.len() as u64)?;
        info!("DOWNLOADED [{} BYTES]", bytes.len());

        if let Some(keep) = &self.option.keep_archive {
            fs::write(keep, &bytes)?;
            debug!("KEEP ARCHIVE [{}]", keep.display());
        }

        Ok(bytes.to_vec())
    }

    fn check_size(&self, size: u64) -> Result<()> {
        if size > self.option.max_size {
            return Err(Error::DatasetFormat(format!(
                "Archive too large: {} bytes (max: {} bytes)",
                size, self.option.max_size
            )));
        }
        Ok(())
    }

    pub fn parse(&self, archive: &[u8]) -> Result<ParsedDataset> {
        parse_archive(archive, self.option.max_malformed_ratio)
    }
}

/// Decompress the archive and parse its single data file
pub fn parse_archive(archive: &[u8], max_malformed_ratio: f64) -> Result<ParsedDataset> {
    let data = decompress(archive)?;
    let parsed = parse_records(&data)?;

    let total = parsed.ranges.len() + parsed.malformed;
    if parsed.ranges.is_empty() {
        return Err(Error::DatasetFormat(format!(
            "No valid record among {} records",
            total
        )));
    }
    let ratio = parsed.malformed as f64 / total as f64;
    if ratio > max_malformed_ratio {
        return Err(Error::DatasetFormat(format!(
            "{} of {} records malformed ({:.2}% > {:.2}%)",
            parsed.malformed,
            total,
            ratio * 100.0,
            max_malformed_ratio * 100.0
        )));
    }

    if parsed.malformed > 0 {
        warn!("SKIPPED [{}] MALFORMED RECORDS", parsed.malformed);
    }
    info!("PARSED [{}] RANGES", parsed.ranges.len());
    Ok(parsed)
}

fn decompress(archive: &[u8]) -> Result<Vec<u8>> {
    match archive {
        [0x50, 0x4b, ..] => unzip(archive),
        [0x1f, 0x8b, ..] => gunzip(archive),
        _ => Err(Error::DatasetFormat(
            "Unrecognized archive format, expected ZIP or gzip".to_string(),
        )),
    }
}

fn unzip(archive: &[u8]) -> Result<Vec<u8>> {
    let mut zip = ZipArchive::new(Cursor::new(archive))
        .map_err(|e| Error::DatasetFormat(format!("Unreadable ZIP archive: {}", e)))?;

    let files: Vec<String> = zip
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(String::from)
        .collect();
    // IP2Location archives ship a LICENSE and README next to the CSV
    let name = match files.as_slice() {
        [single] => single.clone(),
        _ => {
            let data_files: Vec<&String> = files
                .iter()
                .filter(|name| name.to_ascii_lowercase().ends_with(".csv"))
                .collect();
            match data_files.as_slice() {
                [single] => (*single).clone(),
                [] => {
                    return Err(Error::DatasetFormat(
                        "No data file in ZIP archive".to_string(),
                    ));
                }
                _ => {
                    return Err(Error::DatasetFormat(format!(
                        "Ambiguous ZIP archive, {} data files",
                        data_files.len()
                    )));
                }
            }
        }
    };
    debug!("EXTRACT [{}]", name);

    let file = zip
        .by_name(&name)
        .map_err(|e| Error::DatasetFormat(format!("Unreadable ZIP entry {}: {}", name, e)))?;
    read_limited(file)
}

fn gunzip(archive: &[u8]) -> Result<Vec<u8>> { read_limited(GzDecoder::new(archive)) }

fn read_limited(reader: impl Read) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    reader
        .take(MAX_DATA_SIZE + 1)
        .read_to_end(&mut data)
        .map_err(|e| Error::DatasetFormat(format!("Corrupt archive: {}", e)))?;
    if data.len() as u64 > MAX_DATA_SIZE {
        return Err(Error::DatasetFormat(format!(
            "Data file exceeds {} bytes",
            MAX_DATA_SIZE
        )));
    }
    Ok(data)
}

/// Parse `"start","end","CC",...` records, counting the ones that do not fit
fn parse_records(data: &[u8]) -> Result<ParsedDataset> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let mut parsed = ParsedDataset::default();
    for (line, record) in reader.records().enumerate() {
        match record.map_err(|e| e.to_string()).and_then(|r| parse_record(&r)) {
            Ok(range) => parsed.ranges.push(range),
            Err(e) => {
                parsed.malformed += 1;
                if parsed.malformed <= MAX_LOGGED_SKIPS {
                    debug!("SKIP RECORD [{}]: {}", line + 1, e);
                }
            }
        }
    }
    Ok(parsed)
}

fn parse_record(record: &StringRecord) -> std::result::Result<IpRange, String> {
    let field = |i: usize| {
        record
            .get(i)
            .map(str::trim)
            .ok_or_else(|| format!("Missing column {}", i + 1))
    };
    let start: u32 = field(0)?
        .parse()
        .map_err(|_| format!("Invalid start address: {:?}", record.get(0)))?;
    let end: u32 = field(1)?
        .parse()
        .map_err(|_| format!("Invalid end address: {:?}", record.get(1)))?;
    if start > end {
        return Err(format!("Start {} after end {}", start, end));
    }
    let country = field(2)?.parse()?;
    Ok(IpRange {
        start,
        end,
        country,
    })
}
