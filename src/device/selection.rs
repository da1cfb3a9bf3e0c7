use std::io::BufRead;
use std::thread;
use bluer::Adapter;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use futures::lock::Mutex;
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};

use crate::device::types::SelectedDevice;
use crate::error::ConfigError;

/// The user facing flow that picks an instrument.
pub trait DeviceSelector: Send + Sync {
    /// `None` if the user abandoned the flow.
    fn select_device(&self) -> BoxFuture<'_, Option<SelectedDevice>>;
}

/// Remembers the selected instrument across restarts.
pub trait DeviceStore: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Option<SelectedDevice>, ConfigError>>;

    fn save(&self, device: SelectedDevice) -> BoxFuture<'_, Result<(), ConfigError>>;
}

/// Asks on the terminal which instrument to use, offering the devices paired with the adapter
/// and the ones from the config file.
///
/// Terminal lines are read on their own thread, so an abandoned prompt never keeps a blocking
/// read alive in the runtime. Lines typed while no prompt is shown are discarded.
pub struct PromptSelector {
    adapter: Option<Adapter>,
    known_devices: Vec<SelectedDevice>,
    lines: Mutex<UnboundedReceiver<String>>,
}

impl PromptSelector {
    pub fn new(adapter: Option<Adapter>, known_devices: Vec<SelectedDevice>) -> Self {
        let (sender, receiver) = unbounded::<String>();

        let spawned = thread::Builder::new()
            .name("terminal-input".to_string())
            .spawn(move || read_lines(std::io::stdin().lock(), sender));
        if let Err(err) = spawned {
            warn!("Failed to start reading the terminal: {}", err);
        }

        PromptSelector::with_lines(adapter, known_devices, receiver)
    }

    /// Answers are taken from `lines` instead of the terminal.
    pub fn with_lines(adapter: Option<Adapter>, known_devices: Vec<SelectedDevice>, lines: UnboundedReceiver<String>) -> Self {
        PromptSelector {
            adapter,
            known_devices,
            lines: Mutex::new(lines),
        }
    }

    async fn candidates(&self) -> Vec<SelectedDevice> {
        let paired = match &self.adapter {
            Some(adapter) => paired_devices(adapter).await,
            None => Vec::new(),
        };

        merge_devices(&self.known_devices, paired)
    }
}

fn print_prompt(devices: &[SelectedDevice]) {
    println!("Select the instrument to connect to:");
    for (index, device) in devices.iter().enumerate() {
        println!("  {}) {} [{}]", index + 1, device.display_name(), device.address);
    }
    println!("Enter a number, or a bluetooth address optionally followed by a name:");
}

/// Forward every line of `input` until it ends or nobody listens any more.
fn read_lines(input: impl BufRead, sender: UnboundedSender<String>) {
    for line in input.lines() {
        match line {
            Ok(line) => {
                if sender.unbounded_send(line).is_err() {
                    break;
                }
            },
            Err(err) => {
                warn!("Failed to read from the terminal: {}", err);
                break;
            },
        }
    }
    debug!("Terminal input closed");
}

async fn paired_devices(adapter: &Adapter) -> Vec<SelectedDevice> {
    let addresses = match adapter.device_addresses().await {
        Ok(addresses) => addresses,
        Err(err) => {
            warn!("Failed to list bluetooth devices: {}", err);
            return Vec::new();
        },
    };

    let mut devices = Vec::new();
    for address in addresses {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(_) => continue,
        };
        if !device.is_paired().await.unwrap_or(false) {
            continue;
        }

        let name = device.alias().await.ok();
        devices.push(SelectedDevice::new(address.to_string(), name));
    }

    devices
}

/// `known` in order, followed by the `paired` devices that are not among them.
pub fn merge_devices(known: &[SelectedDevice], paired: Vec<SelectedDevice>) -> Vec<SelectedDevice> {
    let mut devices = known.to_vec();

    for device in paired {
        let listed = devices.iter().any(|existing| existing.address.eq_ignore_ascii_case(&device.address));
        if !listed {
            devices.push(device);
        }
    }

    devices
}

/// Interpret one line typed at the prompt.
pub fn parse_selection(input: &str, known_devices: &[SelectedDevice]) -> Option<SelectedDevice> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(number) = input.parse::<usize>() {
        return number
            .checked_sub(1)
            .and_then(|index| known_devices.get(index))
            .cloned();
    }

    let (address, name) = match input.split_once(char::is_whitespace) {
        Some((address, name)) => (address, Some(name.trim().to_string())),
        None => (input, None),
    };

    Some(SelectedDevice::new(address, name))
}

impl DeviceSelector for PromptSelector {
    fn select_device(&self) -> BoxFuture<'_, Option<SelectedDevice>> {
        async move {
            let mut lines = self.lines.lock().await;
            while let Ok(Some(stale)) = lines.try_next() {
                debug!("Discarding terminal input {:?}", stale);
            }

            let devices = self.candidates().await;
            print_prompt(&devices);

            match lines.next().await {
                None => {
                    info!("No terminal input available for device selection");
                    None
                },
                Some(line) => {
                    let selected = parse_selection(&line, &devices);
                    if selected.is_none() {
                        warn!("Not a valid selection: {:?}", line.trim());
                    }
                    selected
                },
            }
        }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    fn known() -> Vec<SelectedDevice> {
        vec![
            SelectedDevice::new("00:11:22:AA:BB:CC", Some("BlueFly".to_string())),
            SelectedDevice::new("00:11:22:AA:BB:DD", None),
        ]
    }

    #[test]
    fn selects_by_number() {
        assert_eq!(parse_selection("2\n", &known()), Some(known()[1].clone()));
        assert_eq!(parse_selection("0", &known()), None);
        assert_eq!(parse_selection("3", &known()), None);
    }

    #[test]
    fn accepts_typed_address_and_name() {
        assert_eq!(
            parse_selection("00:11:22:AA:BB:EE Spare vario", &known()),
            Some(SelectedDevice::new("00:11:22:AA:BB:EE", Some("Spare vario".to_string())))
        );
        assert_eq!(
            parse_selection("00:11:22:AA:BB:EE", &known()),
            Some(SelectedDevice::new("00:11:22:AA:BB:EE", None))
        );
    }

    #[test]
    fn empty_input_abandons() {
        assert_eq!(parse_selection("  \n", &known()), None);
    }

    #[test]
    fn paired_devices_follow_known_ones() {
        let paired = vec![
            SelectedDevice::new("00:11:22:aa:bb:cc", Some("paired alias".to_string())),
            SelectedDevice::new("00:11:22:AA:BB:EE", Some("XCTracer".to_string())),
        ];

        let merged = merge_devices(&known(), paired);

        let addresses: Vec<&str> = merged.iter().map(|device| device.address.as_str()).collect();
        assert_eq!(addresses, vec!["00:11:22:AA:BB:CC", "00:11:22:AA:BB:DD", "00:11:22:AA:BB:EE"]);
        assert_eq!(merged[0].name.as_deref(), Some("BlueFly"));
    }

    #[test]
    fn first_run_offers_paired_devices() {
        let paired = vec![SelectedDevice::new("00:11:22:AA:BB:EE", Some("XCTracer".to_string()))];
        assert_eq!(merge_devices(&[], paired.clone()), paired);
    }

    #[test]
    fn terminal_lines_are_forwarded_until_input_ends() {
        let (sender, mut receiver) = unbounded();
        read_lines(Cursor::new("1\n\n00:11:22:AA:BB:EE\n"), sender);

        let mut lines = Vec::new();
        while let Ok(Some(line)) = receiver.try_next() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["1", "", "00:11:22:AA:BB:EE"]);
        // the sender is gone, so the stream has ended
        assert!(matches!(receiver.try_next(), Ok(None)));
    }

    #[tokio::test]
    async fn input_typed_before_the_prompt_is_discarded() {
        let (sender, receiver) = unbounded();
        sender.unbounded_send("1".to_string()).unwrap();
        let selector = PromptSelector::with_lines(None, known(), receiver);

        let (selected, _) = tokio::join!(
            selector.select_device(),
            async {
                sleep(Duration::from_millis(10)).await;
                sender.unbounded_send("2".to_string()).unwrap();
            },
        );

        assert_eq!(selected, Some(known()[1].clone()));
    }

    #[tokio::test]
    async fn closed_input_abandons_the_selection() {
        let (sender, receiver) = unbounded::<String>();
        drop(sender);
        let selector = PromptSelector::with_lines(None, known(), receiver);

        assert_eq!(selector.select_device().await, None);
    }

    #[tokio::test]
    async fn abandoned_prompt_leaves_the_next_one_working() {
        let (sender, receiver) = unbounded();
        let selector = PromptSelector::with_lines(None, known(), receiver);

        assert!(timeout(Duration::from_millis(20), selector.select_device()).await.is_err());

        let (selected, _) = tokio::join!(
            selector.select_device(),
            async {
                sleep(Duration::from_millis(10)).await;
                sender.unbounded_send("1".to_string()).unwrap();
            },
        );
        assert_eq!(selected, Some(known()[0].clone()));
    }

    #[test]
    fn pending_prompt_does_not_hold_up_runtime_shutdown() {
        let (_sender, receiver) = unbounded::<String>();
        let selector = Arc::new(PromptSelector::with_lines(None, known(), receiver));
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();

        let prompt = runtime.spawn({
            let selector = selector.clone();
            async move { selector.select_device().await }
        });
        runtime.block_on(async {
            sleep(Duration::from_millis(50)).await;
            prompt.abort();
        });

        let started = std::time::Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
