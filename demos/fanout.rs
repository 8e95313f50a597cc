use skein::{Broadcaster, Config};
use std::time::Duration;
use tokio::join;

#[tokio::main]
async fn main() {
    let tx = Broadcaster::<u32>::with_config(Config {
        idle_timeout: Duration::from_secs(5),
        ..Config::default()
    });
    let reclaimer = tx.spawn_reclaimer();

    let mut fast = tx.attach();
    let mut slow = tx.attach_with_timeout(Some(Duration::from_millis(50)));
    let slow_id = slow.id();

    let handle1 = tokio::spawn(async move {
        while let Ok(packet) = fast.next().await {
            println!("fast: {:?}", packet);
            if packet.done {
                break;
            }
        }
    });

    let handle2 = tokio::spawn(async move {
        loop {
            match slow.next().await {
                Ok(packet) => {
                    println!("slow: {:?}", packet);
                    if packet.done {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) if err.is_retryable() => println!("slow: {err}, retrying"),
                Err(err) => {
                    println!("slow: {err}");
                    break;
                }
            }
        }
    });

    let tx_cloned = tx.clone();
    let handle3 = tokio::spawn(async move {
        for i in 1..32 {
            tx_cloned.write(i);
            println!("max backpressure: {}", tx_cloned.max_backpressure());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        if let Err(err) = tx_cloned.write_to_consumer(slow_id, 1000) {
            println!("write_to_consumer: {err}");
        }
        if let Err(err) = tx_cloned.kill_consumer(slow_id, 0) {
            println!("kill_consumer: {err}");
        }
        tx_cloned.close(u32::MAX);
    });

    let _ = join!(handle1, handle2, handle3);
    println!("remaining consumers: {:?}", tx.list_consumer_stats());

    if let Some(reclaimer) = reclaimer {
        reclaimer.abort();
    }
}
